//! Cycle-safe group ancestry walk

use rbac_types::GroupId;
use std::collections::HashSet;

/// Walk upward from each start group through `parent_of`, returning every
/// group reached in first-visit order.
///
/// Each chain visits at most `max_depth` groups (the start counts as one)
/// and stops early at a group already seen, so cyclic parent links and
/// shared ancestors are handled without revisiting.
pub fn walk_group_ancestry<F>(start: &[GroupId], max_depth: usize, mut parent_of: F) -> Vec<GroupId>
where
    F: FnMut(&GroupId) -> Option<GroupId>,
{
    let mut seen: HashSet<GroupId> = HashSet::new();
    let mut order = Vec::new();

    for origin in start {
        let mut current = Some(origin.clone());
        let mut depth = 0;
        while let Some(id) = current {
            if depth >= max_depth || !seen.insert(id.clone()) {
                break;
            }
            depth += 1;
            current = parent_of(&id);
            order.push(id);
        }
    }

    order
}
