//! Reconciliation logic for the vnetops CRDs.
//!
//! Each reconcile normalizes the CR spec into a service request,
//! drives the backend through [`SubnetService`], and reports the
//! outcome on the CR's status conditions. Deletion is detected via
//! `metadata.deletionTimestamp`; resource families orphaned without a
//! delete event are picked up by the controller's periodic sweep.

use crate::error::ControllerError;
use crate::service::{
    BindingParent, ChildSubnetOutcome, ChildSubnetRequest, SubnetBindingRequest, SubnetService,
    VirtualNetworkRequest,
};
use crds::{
    ChildSubnet, Condition, ConditionReason, ParentType, SubnetBinding, VirtualNetwork,
};
use kube::Api;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// How long to wait before re-checking a subnet the backend has not
/// realized yet.
const REALIZATION_REQUEUE: Duration = Duration::from_secs(30);

/// Periodic resync of a VirtualNetwork's backend segments.
const VNETWORK_RESYNC: Duration = Duration::from_secs(120);

/// Reconciles the vnetops CRDs against the policy backend.
pub struct Reconciler {
    pub(crate) service: Arc<SubnetService>,
    pub(crate) child_subnet_api: Api<ChildSubnet>,
    pub(crate) subnet_binding_api: Api<SubnetBinding>,
    pub(crate) virtual_network_api: Api<VirtualNetwork>,
}

impl Reconciler {
    /// Creates a reconciler over the shared service and CRD APIs.
    pub fn new(
        service: Arc<SubnetService>,
        child_subnet_api: Api<ChildSubnet>,
        subnet_binding_api: Api<SubnetBinding>,
        virtual_network_api: Api<VirtualNetwork>,
    ) -> Self {
        Self {
            service,
            child_subnet_api,
            subnet_binding_api,
            virtual_network_api,
        }
    }

    /// Reconciles a ChildSubnet resource.
    pub async fn reconcile_child_subnet(
        &self,
        crd: Arc<ChildSubnet>,
    ) -> Result<Action, ControllerError> {
        let (name, namespace, uid) = identity(&crd.metadata)?;

        if crd.metadata.deletion_timestamp.is_some() {
            info!("Deleting ChildSubnet {}/{}", namespace, name);
            self.service.delete_child_subnet(&uid).await?;
            return Ok(Action::await_change());
        }

        info!("Reconciling ChildSubnet {}/{}", namespace, name);
        let request = ChildSubnetRequest {
            uid: uid.clone(),
            namespace: namespace.clone(),
            name: name.clone(),
            parent: crd.spec.parent.clone(),
            prefix_length: crd.spec.subnet_prefix_length,
            access_mode: crd.spec.access_mode,
        };

        match self.service.create_or_update_child_subnet(&request).await {
            Ok(ChildSubnetOutcome::Provisioned {
                resource_path,
                gateway_cidrs,
                vlan,
            }) => {
                let status_patch = serde_json::json!({
                    "status": {
                        "resourcePath": resource_path,
                        "ipAddresses": gateway_cidrs,
                        "vlan": vlan,
                        "conditions": [Condition::ready()],
                    }
                });
                self.write_status(&self.child_subnet_api, &name, &namespace, status_patch)
                    .await?;
                Ok(Action::await_change())
            }
            Ok(ChildSubnetOutcome::NotRealized) => {
                // Not an error: the backend simply has not realized
                // the pool subnet within the polling budget. Leave a
                // pending condition and come back.
                let condition = Condition::not_ready(
                    ConditionReason::DependencyNotReady,
                    "subnet not yet realized by the backend",
                );
                self.write_status_best_effort(
                    &self.child_subnet_api,
                    &name,
                    &namespace,
                    condition_patch(condition),
                )
                .await;
                Ok(Action::requeue(REALIZATION_REQUEUE))
            }
            Err(err) => {
                self.write_status_best_effort(
                    &self.child_subnet_api,
                    &name,
                    &namespace,
                    condition_patch(failure_condition(&err)),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Reconciles a SubnetBinding resource.
    pub async fn reconcile_subnet_binding(
        &self,
        crd: Arc<SubnetBinding>,
    ) -> Result<Action, ControllerError> {
        let (name, namespace, uid) = identity(&crd.metadata)?;

        if crd.metadata.deletion_timestamp.is_some() {
            info!("Deleting SubnetBinding {}/{}", namespace, name);
            self.service.delete_subnet_binding(&uid).await?;
            return Ok(Action::await_change());
        }

        info!("Reconciling SubnetBinding {}/{}", namespace, name);
        let parent = match crd.spec.parent_type {
            ParentType::Subnets => {
                if crd.spec.subnets.is_empty() {
                    return self
                        .binding_spec_error(
                            &name,
                            &namespace,
                            "type is subnets but no parent subnets are listed",
                        )
                        .await;
                }
                BindingParent::Subnets(crd.spec.subnets.clone())
            }
            ParentType::SubnetSet => match crd.spec.name.as_deref() {
                Some(set) => BindingParent::SubnetSet(set.to_string()),
                None => {
                    return self
                        .binding_spec_error(
                            &name,
                            &namespace,
                            "type is subnetSet but no set name is set",
                        )
                        .await;
                }
            },
            ParentType::VirtualNetwork => match crd.spec.name.as_deref() {
                Some(vnetwork) => BindingParent::VirtualNetwork(vnetwork.to_string()),
                None => {
                    return self
                        .binding_spec_error(
                            &name,
                            &namespace,
                            "type is virtualNetwork but no network name is set",
                        )
                        .await;
                }
            },
        };
        let request = SubnetBindingRequest {
            uid: uid.clone(),
            namespace: namespace.clone(),
            name: name.clone(),
            subnet_path: crd.spec.subnet_path.clone(),
            parent,
            vlan: crd.spec.vlan,
        };

        match self.service.create_or_update_subnet_binding(&request).await {
            Ok(vlan) => {
                let status_patch = serde_json::json!({
                    "status": {
                        "vlan": vlan,
                        "conditions": [Condition::ready()],
                    }
                });
                self.write_status(&self.subnet_binding_api, &name, &namespace, status_patch)
                    .await?;
                Ok(Action::await_change())
            }
            Err(err) => {
                self.write_status_best_effort(
                    &self.subnet_binding_api,
                    &name,
                    &namespace,
                    condition_patch(failure_condition(&err)),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Reconciles a VirtualNetwork resource.
    pub async fn reconcile_virtual_network(
        &self,
        crd: Arc<VirtualNetwork>,
    ) -> Result<Action, ControllerError> {
        let (name, namespace, uid) = identity(&crd.metadata)?;

        if crd.metadata.deletion_timestamp.is_some() {
            info!("Deleting VirtualNetwork {}/{}", namespace, name);
            self.service.delete_virtual_network(&uid);
            return Ok(Action::await_change());
        }

        info!("Reconciling VirtualNetwork {}/{}", namespace, name);
        let request = VirtualNetworkRequest {
            uid,
            namespace: namespace.clone(),
            name: name.clone(),
        };
        match self.service.create_or_update_virtual_network(&request).await {
            Ok(changed) => {
                if changed {
                    self.write_status(
                        &self.virtual_network_api,
                        &name,
                        &namespace,
                        condition_patch(Condition::ready()),
                    )
                    .await?;
                }
                // Backend segments are discovered by tag, so resync on
                // a timer rather than waiting for a CR event.
                Ok(Action::requeue(VNETWORK_RESYNC))
            }
            Err(err) => {
                self.write_status_best_effort(
                    &self.virtual_network_api,
                    &name,
                    &namespace,
                    condition_patch(failure_condition(&err)),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn binding_spec_error(
        &self,
        name: &str,
        namespace: &str,
        message: &str,
    ) -> Result<Action, ControllerError> {
        warn!("SubnetBinding {}/{} rejected: {}", namespace, name, message);
        self.write_status_best_effort(
            &self.subnet_binding_api,
            name,
            namespace,
            condition_patch(Condition::not_ready(
                ConditionReason::DependencyNotReady,
                message,
            )),
        )
        .await;
        Err(ControllerError::Validation(message.to_string()))
    }

    /// Writes a status patch, surfacing failure to the caller so the
    /// reconcile is retried with the status still pending.
    async fn write_status<K>(
        &self,
        api: &Api<K>,
        name: &str,
        namespace: &str,
        status_patch: serde_json::Value,
    ) -> Result<(), ControllerError>
    where
        K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let pp = kube::api::PatchParams::default();
        match api
            .patch_status(name, &pp, &kube::api::Patch::Merge(&status_patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                error!("Failed to update status of {}/{}: {}", namespace, name, e);
                Err(ControllerError::Kube(e))
            }
        }
    }

    /// Writes a failure condition without masking the reconcile error
    /// that caused it.
    async fn write_status_best_effort<K>(
        &self,
        api: &Api<K>,
        name: &str,
        namespace: &str,
        status_patch: serde_json::Value,
    ) where
        K: kube::Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
        K::DynamicType: Default,
    {
        let pp = kube::api::PatchParams::default();
        if let Err(e) = api
            .patch_status(name, &pp, &kube::api::Patch::Merge(&status_patch))
            .await
        {
            warn!(
                "Failed to update error status of {}/{}: {}",
                namespace, name, e
            );
        }
    }
}

fn identity(
    metadata: &kube::api::ObjectMeta,
) -> Result<(String, String, String), ControllerError> {
    let name = metadata
        .name
        .clone()
        .ok_or_else(|| ControllerError::InvalidConfig("resource missing name".to_string()))?;
    let namespace = metadata.namespace.as_deref().unwrap_or("default").to_string();
    let uid = metadata
        .uid
        .clone()
        .ok_or_else(|| ControllerError::InvalidConfig("resource missing uid".to_string()))?;
    Ok((name, namespace, uid))
}

fn condition_patch(condition: Condition) -> serde_json::Value {
    serde_json::json!({
        "status": {
            "conditions": [condition],
        }
    })
}

/// Maps a reconcile error onto the condition reason catalog.
fn failure_condition(err: &ControllerError) -> Condition {
    let reason = match err {
        ControllerError::Validation(_) | ControllerError::InvalidConfig(_) => {
            ConditionReason::DependencyNotReady
        }
        ControllerError::IpBlockExhausted { .. } => ConditionReason::CapacityExhausted,
        ControllerError::AllocationExhausted(_) => ConditionReason::AllocationExhausted,
        _ => ConditionReason::BackendError,
    };
    Condition::not_ready(reason, err.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn failure_conditions_use_the_reason_catalog() {
        let capacity = failure_condition(&ControllerError::IpBlockExhausted {
            block_path: "/infra/ip-blocks/b".to_string(),
        });
        assert_eq!(capacity.reason, ConditionReason::CapacityExhausted);
        assert_eq!(capacity.status, "False");

        let validation =
            failure_condition(&ControllerError::Validation("no parent".to_string()));
        assert_eq!(validation.reason, ConditionReason::DependencyNotReady);

        let vlan = failure_condition(&ControllerError::AllocationExhausted(
            "no tag left".to_string(),
        ));
        assert_eq!(vlan.reason, ConditionReason::AllocationExhausted);

        let backend = failure_condition(&ControllerError::Watch("stream closed".to_string()));
        assert_eq!(backend.reason, ConditionReason::BackendError);
    }

    #[test]
    fn condition_patch_targets_the_status_subresource() {
        let patch = condition_patch(Condition::ready());
        let conditions = patch["status"]["conditions"].as_array().unwrap();
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0]["status"], "True");
    }
}
