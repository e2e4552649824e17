//! Dependency index: prerequisite edges and unique-name membership.
//!
//! Design:
//! - Forward edges: work -> works it waits for (prerequisites)
//! - Reverse edges: work -> works waiting for it (dependents)
//! - Invariant: both directions are always kept in sync
//! - Names: unique name -> every record enqueued under it

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::domain::WorkId;
use crate::ports::Dependency;

#[derive(Debug, Clone, Default)]
pub struct DependencyIndex {
    prerequisites: HashMap<WorkId, BTreeSet<WorkId>>,
    dependents: HashMap<WorkId, BTreeSet<WorkId>>,
    names: HashMap<String, BTreeSet<WorkId>>,
}

impl DependencyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// `dependent` waits for `prerequisite`.
    pub fn add_dependency(&mut self, dependent: WorkId, prerequisite: WorkId) {
        self.prerequisites
            .entry(dependent)
            .or_default()
            .insert(prerequisite);
        self.dependents
            .entry(prerequisite)
            .or_default()
            .insert(dependent);
    }

    pub fn remove_dependency(&mut self, dependent: WorkId, prerequisite: WorkId) {
        remove_from(&mut self.prerequisites, dependent, &prerequisite);
        remove_from(&mut self.dependents, prerequisite, &dependent);
    }

    pub fn prerequisites_of(&self, id: WorkId) -> Vec<WorkId> {
        self.prerequisites
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn dependents_of(&self, id: WorkId) -> Vec<WorkId> {
        self.dependents
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_prerequisites(&self, id: WorkId) -> bool {
        self.prerequisites.get(&id).is_some_and(|set| !set.is_empty())
    }

    pub fn has_dependents(&self, id: WorkId) -> bool {
        self.dependents.get(&id).is_some_and(|set| !set.is_empty())
    }

    /// Every work that transitively waits for `id`, breadth first, without `id` itself.
    pub fn transitive_dependents(&self, id: WorkId) -> Vec<WorkId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue: VecDeque<WorkId> = self.dependents_of(id).into();
        while let Some(next) = queue.pop_front() {
            if next == id || !seen.insert(next) {
                continue;
            }
            order.push(next);
            queue.extend(self.dependents_of(next));
        }
        order
    }

    pub fn add_name(&mut self, name: &str, id: WorkId) {
        self.names.entry(name.to_string()).or_default().insert(id);
    }

    pub fn ids_for_name(&self, name: &str) -> Vec<WorkId> {
        self.names
            .get(name)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Drops every edge touching `id` and removes it from all names.
    pub fn remove_work(&mut self, id: WorkId) {
        for prerequisite in self.prerequisites_of(id) {
            self.remove_dependency(id, prerequisite);
        }
        for dependent in self.dependents_of(id) {
            self.remove_dependency(dependent, id);
        }
        self.names.retain(|_, ids| {
            ids.remove(&id);
            !ids.is_empty()
        });
    }

    pub fn edges(&self) -> Vec<Dependency> {
        let mut edges: Vec<Dependency> = self
            .prerequisites
            .iter()
            .flat_map(|(dependent, prerequisites)| {
                prerequisites.iter().map(|prerequisite| Dependency {
                    prerequisite: *prerequisite,
                    dependent: *dependent,
                })
            })
            .collect();
        edges.sort_by_key(|edge| (edge.dependent, edge.prerequisite));
        edges
    }

    /// Detect a cycle in the prerequisite graph.
    ///
    /// Iterative three-colour DFS, O(V + E). Returns the ids on the first cycle found,
    /// starting and ending with the same id.
    pub fn detect_cycle(&self) -> Option<Vec<WorkId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            Gray,
            Black,
        }

        let mut color: HashMap<WorkId, Color> = HashMap::new();
        let mut roots: Vec<WorkId> = self.prerequisites.keys().copied().collect();
        roots.sort();

        for root in roots {
            if color.contains_key(&root) {
                continue;
            }
            // (node, its prerequisites, next index to visit)
            let mut stack: Vec<(WorkId, Vec<WorkId>, usize)> =
                vec![(root, self.prerequisites_of(root), 0)];
            color.insert(root, Color::Gray);

            while let Some((node, children, index)) = stack.last_mut() {
                if *index >= children.len() {
                    color.insert(*node, Color::Black);
                    stack.pop();
                    continue;
                }
                let child = children[*index];
                *index += 1;
                match color.get(&child) {
                    Some(Color::Gray) => {
                        let start = stack
                            .iter()
                            .position(|(id, _, _)| *id == child)
                            .unwrap_or(0);
                        let mut cycle: Vec<WorkId> =
                            stack[start..].iter().map(|(id, _, _)| *id).collect();
                        cycle.push(child);
                        return Some(cycle);
                    }
                    Some(Color::Black) => {}
                    None => {
                        color.insert(child, Color::Gray);
                        let grandchildren = self.prerequisites_of(child);
                        stack.push((child, grandchildren, 0));
                    }
                }
            }
        }
        None
    }
}

fn remove_from(map: &mut HashMap<WorkId, BTreeSet<WorkId>>, key: WorkId, value: &WorkId) {
    if let Entry::Occupied(mut entry) = map.entry(key) {
        entry.get_mut().remove(value);
        if entry.get().is_empty() {
            entry.remove_entry();
        }
    }
}
