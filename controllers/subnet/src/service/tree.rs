//! Org-rooted hierarchical intent builder.
//!
//! Subnet binding maps live below organizations, so their writes are
//! addressed through the ancestor chain org → project → virtual
//! network → subnet. This module parses a bound subnet's address into
//! that chain, merges the per-leaf chains into one minimal tree, and
//! serializes it depth-first into typed child-reference wrappers
//! under an `OrgRoot`.

use crate::error::ControllerError;
use policy_client::{OrgRoot, SubnetBindingMap, wrap_child, wrap_child_resource_reference};
use serde_json::Value;
use tracing::error;

const TARGET_ORG: &str = "Org";
const TARGET_PROJECT: &str = "Project";
const TARGET_VNETWORK: &str = "VirtualNetwork";
const TARGET_SUBNET: &str = "Subnet";
const LEAF_TYPE: &str = "SubnetConnectionBindingMap";

/// Ancestor ids parsed from a bound subnet address of the form
/// `/orgs/{org}/projects/{project}/vnetworks/{vnetwork}/subnets/{subnet}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetPathInfo {
    pub org_id: String,
    pub project_id: String,
    pub vnetwork_id: String,
    pub subnet_id: String,
}

/// Parse a bound subnet address into its ancestor chain.
pub fn parse_subnet_path(path: &str) -> Result<SubnetPathInfo, ControllerError> {
    let parts: Vec<&str> = path.split('/').collect();
    // ["", "orgs", o, "projects", p, "vnetworks", v, "subnets", s]
    if parts.len() != 9
        || !parts[0].is_empty()
        || parts[1] != "orgs"
        || parts[3] != "projects"
        || parts[5] != "vnetworks"
        || parts[7] != "subnets"
        || parts[2].is_empty()
        || parts[4].is_empty()
        || parts[6].is_empty()
        || parts[8].is_empty()
    {
        return Err(ControllerError::Validation(format!(
            "invalid subnet path {path}"
        )));
    }
    Ok(SubnetPathInfo {
        org_id: parts[2].to_string(),
        project_id: parts[4].to_string(),
        vnetwork_id: parts[6].to_string(),
        subnet_id: parts[8].to_string(),
    })
}

struct HierarchyNode {
    target_type: &'static str,
    id: String,
    binding_map: Option<SubnetBindingMap>,
    children: Vec<HierarchyNode>,
}

impl HierarchyNode {
    fn leaf(binding_map: SubnetBindingMap) -> Self {
        Self {
            target_type: LEAF_TYPE,
            id: binding_map.id.clone(),
            binding_map: Some(binding_map),
            children: Vec::new(),
        }
    }

    fn ancestor(target_type: &'static str, id: String, child: HierarchyNode) -> Self {
        Self {
            target_type,
            id,
            binding_map: None,
            children: vec![child],
        }
    }

    /// Merge `node` into this node's children. Siblings with the same
    /// (type, id) collapse into one; leaves always append, two binding
    /// maps never merge.
    fn merge_child(&mut self, node: HierarchyNode) {
        if node.target_type == LEAF_TYPE {
            self.children.push(node);
            return;
        }
        for child in &mut self.children {
            if child.target_type == node.target_type && child.id == node.id {
                for grandchild in node.children {
                    child.merge_child(grandchild);
                }
                return;
            }
        }
        self.children.push(node);
    }

    fn serialize(&self) -> Result<Vec<Value>, ControllerError> {
        if let Some(binding_map) = &self.binding_map {
            return Ok(vec![wrap_child(binding_map).map_err(ControllerError::Policy)?]);
        }
        let mut children = Vec::new();
        for child in &self.children {
            children.extend(child.serialize()?);
        }
        Ok(vec![wrap_child_resource_reference(
            self.target_type,
            &self.id,
            children,
        )])
    }
}

fn chain_for(info: &SubnetPathInfo, binding_map: SubnetBindingMap) -> HierarchyNode {
    HierarchyNode::ancestor(
        TARGET_ORG,
        info.org_id.clone(),
        HierarchyNode::ancestor(
            TARGET_PROJECT,
            info.project_id.clone(),
            HierarchyNode::ancestor(
                TARGET_VNETWORK,
                info.vnetwork_id.clone(),
                HierarchyNode::ancestor(
                    TARGET_SUBNET,
                    info.subnet_id.clone(),
                    HierarchyNode::leaf(binding_map),
                ),
            ),
        ),
    )
}

/// Pack binding maps into one org-rooted intent.
///
/// Each map is addressed under `subnet_path` when given, otherwise
/// under its own recorded parent path. When `mark_for_delete` is set
/// it overrides every map's tombstone flag. A map with an unparseable
/// address fails that map only, logged and skipped. An empty batch
/// yields `None`.
pub fn build_org_root(
    binding_maps: Vec<SubnetBindingMap>,
    mark_for_delete: Option<bool>,
    subnet_path: Option<&str>,
) -> Result<Option<OrgRoot>, ControllerError> {
    let mut roots: Vec<HierarchyNode> = Vec::new();
    let mut attached = false;

    for mut binding_map in binding_maps {
        if let Some(delete) = mark_for_delete {
            binding_map.marked_for_delete = delete;
        }
        let parent_path = match subnet_path {
            Some(path) => path.to_string(),
            None => match &binding_map.parent_path {
                Some(path) => path.clone(),
                None => {
                    error!(id = binding_map.id, "Binding map has no parent path, skipping");
                    continue;
                }
            },
        };
        let info = match parse_subnet_path(&parent_path) {
            Ok(info) => info,
            Err(err) => {
                error!(id = binding_map.id, %err, "Failed to address binding map, skipping");
                continue;
            }
        };

        let chain = chain_for(&info, binding_map);
        if let Some(root) = roots
            .iter_mut()
            .find(|r| r.target_type == chain.target_type && r.id == chain.id)
        {
            for child in chain.children {
                root.merge_child(child);
            }
        } else {
            roots.push(chain);
        }
        attached = true;
    }

    if !attached {
        return Ok(None);
    }

    let mut children = Vec::new();
    for root in &roots {
        children.extend(root.serialize()?);
    }
    Ok(Some(OrgRoot::new(children)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn binding_map(id: &str, parent_path: &str) -> SubnetBindingMap {
        SubnetBindingMap {
            id: id.to_string(),
            parent_path: Some(parent_path.to_string()),
            vlan_traffic_tag: Some(10),
            ..SubnetBindingMap::default()
        }
    }

    const PATH_A: &str = "/orgs/default/projects/proj1/vnetworks/net1/subnets/sub1";
    const PATH_B: &str = "/orgs/default/projects/proj1/vnetworks/net1/subnets/sub2";

    #[test]
    fn subnet_path_parses_into_ancestor_chain() {
        let info = parse_subnet_path(PATH_A).unwrap();
        assert_eq!(info.org_id, "default");
        assert_eq!(info.project_id, "proj1");
        assert_eq!(info.vnetwork_id, "net1");
        assert_eq!(info.subnet_id, "sub1");
        assert!(parse_subnet_path("/orgs/default/projects/proj1").is_err());
        assert!(parse_subnet_path("/infra/segments/cs_u1").is_err());
    }

    fn count_nodes(node: &Value) -> (usize, usize) {
        // (ancestor references, leaf wrappers)
        if node["resource_type"] == "ChildResourceReference" {
            let mut refs = 1;
            let mut leaves = 0;
            if let Some(children) = node["children"].as_array() {
                for child in children {
                    let (r, l) = count_nodes(child);
                    refs += r;
                    leaves += l;
                }
            }
            (refs, leaves)
        } else {
            (0, 1)
        }
    }

    #[test]
    fn shared_ancestors_merge_regardless_of_insertion_order() {
        let forward = build_org_root(
            vec![binding_map("sbm_u1_p1", PATH_A), binding_map("sbm_u1_p2", PATH_A)],
            None,
            None,
        )
        .unwrap()
        .unwrap();
        let reverse = build_org_root(
            vec![binding_map("sbm_u1_p2", PATH_A), binding_map("sbm_u1_p1", PATH_A)],
            None,
            None,
        )
        .unwrap()
        .unwrap();

        for root in [&forward, &reverse] {
            assert_eq!(root.children.len(), 1);
            let (refs, leaves) = count_nodes(&root.children[0]);
            // org, project, vnetwork, subnet
            assert_eq!(refs, 4);
            assert_eq!(leaves, 2);
        }
    }

    #[test]
    fn distinct_subnets_fork_below_the_shared_ancestors() {
        let root = build_org_root(
            vec![binding_map("sbm_u1_p1", PATH_A), binding_map("sbm_u2_p1", PATH_B)],
            None,
            None,
        )
        .unwrap()
        .unwrap();
        assert_eq!(root.children.len(), 1);
        let (refs, leaves) = count_nodes(&root.children[0]);
        // org, project, vnetwork shared; two subnet nodes
        assert_eq!(refs, 5);
        assert_eq!(leaves, 2);
    }

    #[test]
    fn unparseable_leaf_is_skipped_not_fatal() {
        let root = build_org_root(
            vec![
                binding_map("sbm_u1_p1", PATH_A),
                binding_map("sbm_broken", "/not/a/subnet"),
            ],
            None,
            None,
        )
        .unwrap()
        .unwrap();
        let (_, leaves) = count_nodes(&root.children[0]);
        assert_eq!(leaves, 1);
    }

    #[test]
    fn empty_batch_yields_none() {
        assert!(build_org_root(Vec::new(), None, None).unwrap().is_none());
    }

    #[test]
    fn delete_override_tombstones_every_leaf() {
        let root = build_org_root(
            vec![binding_map("sbm_u1_p1", PATH_A)],
            Some(true),
            Some(PATH_A),
        )
        .unwrap()
        .unwrap();
        let mut node = &root.children[0];
        while node["resource_type"] == "ChildResourceReference" {
            node = &node["children"][0];
        }
        assert_eq!(node["resource_type"], "ChildSubnetConnectionBindingMap");
        assert_eq!(node["marked_for_delete"], true);
    }
}
