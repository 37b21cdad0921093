//! Transitive exclusive-tag propagation, conflict detection, and compatibility partitioning.
//!
//! Two targets that pull in mutually-exclusive versions of the same library must never end up
//! on the same classpath. Exclusives are declared per-target as a multimap and propagated down
//! the dependency graph; targets are then bucketed into groups whose keys never disagree on a
//! shared axis.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    address::Address,
    error::{BuildError, Result},
    graph::BuildGraph,
};

pub const NONE_SENTINEL: &str = "<none>";

/// `map<key, set<value>>`. A declaration binds each key to exactly one value; a propagated map
/// is the set-union of a target's own declaration and every transitive dependency's.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExclusivesMap(pub BTreeMap<String, BTreeSet<String>>);

impl ExclusivesMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().insert(value.into());
    }

    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.0.get(key)
    }

    /// Multimap union: `self ⊎ other`, consuming neither.
    pub fn union(&self, other: &ExclusivesMap) -> ExclusivesMap {
        let mut merged = self.clone();
        for (key, values) in &other.0 {
            merged.0.entry(key.clone()).or_default().extend(values.iter().cloned());
        }
        merged
    }

    /// Keys whose value set has more than one member.
    pub fn conflicting_keys(&self) -> Vec<&str> {
        self.0.iter().filter(|(_, v)| v.len() > 1).map(|(k, _)| k.as_str()).collect()
    }
}

/// Ordered tuple of `(axis_key, value_or_sentinel)` identifying a target's compatibility group.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey(pub Vec<(String, String)>);

impl GroupKey {
    /// `G1` is compatible with `G2` iff for every axis key either the values agree, or at least
    /// one side is the `<none>` sentinel.
    pub fn compatible_with(&self, other: &GroupKey) -> bool {
        self.0.iter().zip(other.0.iter()).all(|((k1, v1), (k2, v2))| {
            debug_assert_eq!(k1, k2, "group keys must share the same axis ordering");
            v1 == v2 || v1 == NONE_SENTINEL || v2 == NONE_SENTINEL
        })
    }
}

/// Propagates declared exclusives through the dependency DAG in topological order and computes
/// per-target `computed_exclusives`, memoising as it goes.
pub fn propagate(graph: &BuildGraph) -> Result<BTreeMap<Address, ExclusivesMap>> {
    let order = graph.sorted_targets()?; // most-dependent first
    let mut computed: BTreeMap<Address, ExclusivesMap> = BTreeMap::new();

    // Process dependency-first: walk the reverse of `order` (least-dependent first) so every
    // dependency's computed map is available before its dependents need it.
    for address in order.iter().rev() {
        let target = graph.get_target(address)?;
        let mut merged = target.declared_exclusives.clone();
        for dep in graph.dependencies_of(address)? {
            let dep_computed =
                computed.get(dep).expect("dependencies are processed before dependents");
            merged = merged.union(dep_computed);
        }
        computed.insert(address.clone(), merged);
    }

    Ok(computed)
}

/// Strict-mode conflict check: fatal if any target's computed map has a key with more than one
/// value. In non-strict mode, callers should instead rely on partitioning to separate
/// conflicting targets and simply record the warnings they receive.
pub fn check_strict(
    computed: &BTreeMap<Address, ExclusivesMap>,
) -> Result<Vec<(Address, String, usize)>> {
    let mut conflicts = Vec::new();
    for (address, map) in computed {
        for key in map.conflicting_keys() {
            conflicts.push((address.clone(), key.to_string(), map.get(key).unwrap().len()));
        }
    }
    if let Some((target, key, count)) = conflicts.first().cloned() {
        return Err(BuildError::ExclusivesConflict { target, key, count });
    }
    Ok(conflicts)
}

/// Global exclusives map over every known target; keys with more than one distinct value
/// anywhere in the build become the partition axis.
pub fn partition_axis(computed: &BTreeMap<Address, ExclusivesMap>) -> Vec<String> {
    let mut global = ExclusivesMap::new();
    for map in computed.values() {
        global = global.union(map);
    }
    global.conflicting_keys().into_iter().map(str::to_string).collect()
}

pub fn group_key_for(map: &ExclusivesMap, axis: &[String]) -> GroupKey {
    let mut entries = Vec::with_capacity(axis.len());
    for key in axis {
        let value = match map.get(key) {
            Some(values) if values.len() == 1 => values.iter().next().unwrap().clone(),
            _ => NONE_SENTINEL.to_string(),
        };
        entries.push((key.clone(), value));
    }
    GroupKey(entries)
}

/// Append-only, thread-safe store mapping each compatibility group to the classpath entries
/// contributed under it or any group compatible with it.
#[derive(Debug, Default)]
pub struct ExclusivesGroups {
    classpaths: std::sync::Mutex<BTreeMap<GroupKey, Vec<String>>>,
}

impl ExclusivesGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_compatible_classpaths(&self, group: &GroupKey, entry: impl Into<String>) {
        let entry = entry.into();
        let mut classpaths = self.classpaths.lock().unwrap();
        let keys: Vec<GroupKey> = classpaths.keys().cloned().collect();
        for key in keys {
            if key.compatible_with(group) && !classpaths[&key].contains(&entry) {
                classpaths.get_mut(&key).unwrap().push(entry.clone());
            }
        }
        let bucket = classpaths.entry(group.clone()).or_default();
        if !bucket.contains(&entry) {
            bucket.push(entry);
        }
    }

    pub fn get_classpath_for_group(&self, group: &GroupKey) -> Vec<String> {
        let classpaths = self.classpaths.lock().unwrap();
        let mut out = Vec::new();
        for (key, entries) in classpaths.iter() {
            if key.compatible_with(group) {
                for entry in entries {
                    if !out.contains(entry) {
                        out.push(entry.clone());
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Payload, Target};

    fn target(addr: &str, excl: &[(&str, &str)]) -> Target {
        let mut map = ExclusivesMap::new();
        for (k, v) in excl {
            map.declare(*k, *v);
        }
        Target::new(
            Address::from_str_unchecked(addr),
            map,
            Payload::JarLibrary { jars: vec![], overrides: vec![] },
        )
    }

    impl Address {
        fn from_str_unchecked(s: &str) -> Address {
            let (path, name) = s.split_once(':').unwrap();
            Address::new(path, name)
        }
    }

    #[test]
    fn propagation_matches_scenario_2() {
        let mut graph = BuildGraph::new();
        graph.inject_target(target("x:a", &[("a", "1"), ("b", "1")]), vec![]).unwrap();
        graph.inject_target(target("x:b", &[("a", "1")]), vec![]).unwrap();
        graph.inject_target(target("x:c", &[("a", "2")]), vec![]).unwrap();
        graph
            .inject_target(
                target("x:d", &[]),
                vec![Address::from_str_unchecked("x:a"), Address::from_str_unchecked("x:b")],
            )
            .unwrap();
        graph
            .inject_target(
                target("x:e", &[]),
                vec![
                    Address::from_str_unchecked("x:a"),
                    Address::from_str_unchecked("x:c"),
                ],
            )
            .unwrap();

        let computed = propagate(&graph).unwrap();
        let d = &computed[&Address::from_str_unchecked("x:d")];
        assert_eq!(d.get("a").unwrap().len(), 1);
        let e = &computed[&Address::from_str_unchecked("x:e")];
        assert_eq!(e.get("a").unwrap().len(), 2);

        assert!(check_strict(&computed).is_err());
    }

    #[test]
    fn partition_axis_and_groups_match_scenario_3() {
        let mut computed = BTreeMap::new();
        let mut a = ExclusivesMap::new();
        a.declare("a", "1");
        computed.insert(Address::from_str_unchecked("x:a"), a.clone());
        computed.insert(Address::from_str_unchecked("x:b"), a.clone());
        computed.insert(Address::from_str_unchecked("x:d"), a);
        let mut c = ExclusivesMap::new();
        c.declare("a", "2");
        computed.insert(Address::from_str_unchecked("x:c"), c);

        let axis = partition_axis(&computed);
        assert_eq!(axis, vec!["a".to_string()]);

        let mut groups: BTreeMap<GroupKey, Vec<&Address>> = BTreeMap::new();
        for (addr, map) in &computed {
            groups.entry(group_key_for(map, &axis)).or_default().push(addr);
        }
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn compatible_groups_share_classpath_entries() {
        let groups = ExclusivesGroups::new();
        let g1 = GroupKey(vec![("a".into(), "1".into())]);
        let g2 = GroupKey(vec![("a".into(), NONE_SENTINEL.into())]);
        groups.update_compatible_classpaths(&g1, "jar-1.jar");
        groups.update_compatible_classpaths(&g2, "jar-none.jar");
        let classpath = groups.get_classpath_for_group(&g1);
        assert!(classpath.contains(&"jar-1.jar".to_string()));
        assert!(classpath.contains(&"jar-none.jar".to_string()));
    }
}
