// src/coordinator/graph.rs

//! Component registry with dependency edges
//!
//! `dependencies` may name components that are not registered yet. Every
//! registered component's `dependents` is the exact transpose of the
//! `dependencies` of the other registered components, and the dependency
//! relation never contains a cycle.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use super::component::ComponentInfo;
use crate::error::{ComponentOperation, Error, Result};

#[derive(Debug, Default)]
pub struct ComponentGraph {
    components: BTreeMap<String, ComponentInfo>,
}

impl ComponentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.components.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&ComponentInfo> {
        self.components.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ComponentInfo> {
        self.components.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.components.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ComponentInfo> {
        self.components.values_mut()
    }

    /// Adds a component, returning the dependencies that are not registered
    ///
    /// Components registered earlier that already list the new one as a
    /// dependency become its dependents.
    pub fn register(&mut self, mut info: ComponentInfo) -> Result<Vec<String>> {
        let name = info.name.clone();
        if self.components.contains_key(&name) {
            return Err(Error::component(
                &name,
                ComponentOperation::Register,
                format!("Component '{}' is already registered", name),
            ));
        }

        if let Some(dependency) = info
            .dependencies
            .iter()
            .find(|dependency| self.would_create_cycle(&name, dependency))
        {
            return Err(Error::dependency_cycle(&name, dependency));
        }

        let mut dangling = Vec::new();
        for dependency in &info.dependencies {
            match self.components.get_mut(dependency) {
                Some(registered) => {
                    registered.dependents.insert(name.clone());
                }
                None => dangling.push(dependency.clone()),
            }
        }

        info.dependents = self
            .components
            .values()
            .filter(|other| other.dependencies.contains(&name))
            .map(|other| other.name.clone())
            .collect();

        self.components.insert(name, info);
        Ok(dangling)
    }

    /// Removes a component that nothing registered depends on
    pub fn unregister(&mut self, name: &str) -> Result<ComponentInfo> {
        let info = self
            .components
            .get(name)
            .ok_or_else(|| not_found(name, ComponentOperation::Unregister))?;

        if !info.dependents.is_empty() {
            return Err(Error::component(
                name,
                ComponentOperation::Unregister,
                format!(
                    "Component '{}' still has dependents: {}",
                    name,
                    info.dependents.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
            ));
        }

        let info = self
            .components
            .remove(name)
            .ok_or_else(|| not_found(name, ComponentOperation::Unregister))?;
        for dependency in &info.dependencies {
            if let Some(registered) = self.components.get_mut(dependency) {
                registered.dependents.remove(name);
            }
        }
        Ok(info)
    }

    /// True when `component -> dependency` would close a cycle
    ///
    /// Walks depth-first from `dependency` along dependency edges looking for
    /// `component`, including through names that are not registered.
    pub fn would_create_cycle(&self, component: &str, dependency: &str) -> bool {
        if component == dependency {
            return true;
        }

        let mut stack = vec![dependency];
        let mut visited = HashSet::new();

        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            let Some(info) = self.components.get(current) else {
                continue;
            };
            for next in &info.dependencies {
                if next == component {
                    return true;
                }
                stack.push(next);
            }
        }
        false
    }

    /// Adds `component -> dependency`; returns whether the dependency is registered
    pub fn add_dependency(&mut self, component: &str, dependency: &str) -> Result<bool> {
        let info = self
            .components
            .get(component)
            .ok_or_else(|| not_found(component, ComponentOperation::AddDependency))?;
        if info.dependencies.contains(dependency) {
            return Ok(self.components.contains_key(dependency));
        }

        if self.would_create_cycle(component, dependency) {
            return Err(Error::dependency_cycle(component, dependency));
        }

        if let Some(info) = self.components.get_mut(component) {
            info.dependencies.insert(dependency.to_string());
            info.touch();
        }
        match self.components.get_mut(dependency) {
            Some(registered) => {
                registered.dependents.insert(component.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes `component -> dependency`; returns whether the edge existed
    pub fn remove_dependency(&mut self, component: &str, dependency: &str) -> Result<bool> {
        let info = self
            .components
            .get_mut(component)
            .ok_or_else(|| not_found(component, ComponentOperation::RemoveDependency))?;
        if !info.dependencies.remove(dependency) {
            return Ok(false);
        }
        info.touch();

        if let Some(registered) = self.components.get_mut(dependency) {
            registered.dependents.remove(component);
        }
        Ok(true)
    }

    pub fn dependency_graph(&self) -> BTreeMap<String, BTreeSet<String>> {
        self.components
            .iter()
            .map(|(name, info)| (name.clone(), info.dependencies.clone()))
            .collect()
    }

    /// Registered components, every dependency before its dependents
    ///
    /// Dependencies that are not registered are ignored.
    pub fn topological_order(&self) -> Vec<String> {
        let mut pending: BTreeMap<&str, usize> = self
            .components
            .values()
            .map(|info| {
                let registered = info
                    .dependencies
                    .iter()
                    .filter(|dependency| self.components.contains_key(*dependency))
                    .count();
                (info.name.as_str(), registered)
            })
            .collect();

        let mut ready: VecDeque<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(self.components.len());

        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            let Some(info) = self.components.get(name) else {
                continue;
            };
            for dependent in &info.dependents {
                if let Some(count) = pending.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent.as_str());
                    }
                }
            }
        }
        order
    }

    /// `name` and everything it transitively depends on, dependencies first
    ///
    /// Unregistered names are included so callers can treat them as unknown.
    pub fn dependency_closure(&self, name: &str) -> Vec<String> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        self.visit_dependencies(name, &mut visited, &mut order);
        order
    }

    fn visit_dependencies(&self, name: &str, visited: &mut HashSet<String>, order: &mut Vec<String>) {
        if !visited.insert(name.to_string()) {
            return;
        }
        if let Some(info) = self.components.get(name) {
            for dependency in &info.dependencies {
                self.visit_dependencies(dependency, visited, order);
            }
        }
        order.push(name.to_string());
    }

    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        self.components.values().all(|info| {
            let expected: BTreeSet<String> = self
                .components
                .values()
                .filter(|other| other.dependencies.contains(&info.name))
                .map(|other| other.name.clone())
                .collect();
            expected == info.dependents
        })
    }
}

fn not_found(name: &str, operation: ComponentOperation) -> Error {
    Error::component(
        name,
        operation,
        format!("Component '{}' is not registered", name),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(name: &str, dependencies: &[&str]) -> ComponentInfo {
        ComponentInfo::new(
            name,
            "test",
            dependencies.iter().map(|d| d.to_string()).collect(),
        )
    }

    #[test]
    fn test_register_sets_reverse_edges() {
        let mut graph = ComponentGraph::new();
        graph.register(component("audio_capture", &[])).unwrap();
        let dangling = graph
            .register(component("asr_engine", &["audio_capture", "config_loader"]))
            .unwrap();

        assert_eq!(dangling, vec!["config_loader".to_string()]);
        assert!(graph.get("audio_capture").unwrap().dependents.contains("asr_engine"));
        assert!(graph.is_consistent());
        assert!(graph.register(component("asr_engine", &[])).is_err());
    }

    #[test]
    fn test_late_dependency_is_reconciled() {
        let mut graph = ComponentGraph::new();
        graph.register(component("asr_engine", &["config_loader"])).unwrap();
        graph.register(component("tts_engine", &["config_loader"])).unwrap();
        graph.register(component("config_loader", &[])).unwrap();

        let dependents = &graph.get("config_loader").unwrap().dependents;
        assert_eq!(dependents.len(), 2);
        assert!(graph.is_consistent());
        assert!(graph.unregister("config_loader").is_err());
    }

    #[test]
    fn test_cycles_are_refused() {
        let mut graph = ComponentGraph::new();
        graph.register(component("a", &[])).unwrap();
        graph.register(component("b", &[])).unwrap();

        graph.add_dependency("a", "b").unwrap();
        let before = graph.dependency_graph();
        assert!(graph.add_dependency("b", "a").is_err());
        assert!(graph.add_dependency("a", "a").is_err());
        assert_eq!(graph.dependency_graph(), before);
        assert!(graph.is_consistent());
    }

    #[test]
    fn test_registration_closing_cycle_through_pending_edge() {
        let mut graph = ComponentGraph::new();
        graph.register(component("a", &["c"])).unwrap();
        graph.register(component("b", &["a"])).unwrap();

        assert!(graph.register(component("c", &["b"])).is_err());
        assert!(!graph.contains("c"));
        assert!(graph.register(component("c", &[])).is_ok());
        assert!(graph.is_consistent());
    }

    #[test]
    fn test_unregister_and_remove_dependency() {
        let mut graph = ComponentGraph::new();
        graph.register(component("audio_capture", &[])).unwrap();
        graph.register(component("asr_engine", &["audio_capture"])).unwrap();

        let before = graph.dependency_graph();
        assert!(graph.unregister("audio_capture").is_err());
        assert_eq!(graph.dependency_graph(), before);

        assert!(graph.remove_dependency("asr_engine", "audio_capture").unwrap());
        assert!(!graph.remove_dependency("asr_engine", "audio_capture").unwrap());
        assert!(graph.unregister("audio_capture").is_ok());
        assert!(graph.unregister("audio_capture").is_err());
        assert!(graph.is_consistent());
    }

    #[test]
    fn test_topological_order() {
        let mut graph = ComponentGraph::new();
        graph.register(component("excel_exporter", &["asr_engine"])).unwrap();
        graph.register(component("asr_engine", &["audio_capture", "config_loader"])).unwrap();
        graph.register(component("audio_capture", &["config_loader"])).unwrap();
        graph.register(component("config_loader", &[])).unwrap();

        let order = graph.topological_order();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position("config_loader") < position("audio_capture"));
        assert!(position("audio_capture") < position("asr_engine"));
        assert!(position("asr_engine") < position("excel_exporter"));
    }

    #[test]
    fn test_dependency_closure_includes_unknown_names() {
        let mut graph = ComponentGraph::new();
        graph.register(component("b", &["ghost"])).unwrap();
        graph.register(component("a", &["b"])).unwrap();

        assert_eq!(graph.dependency_closure("a"), vec!["ghost", "b", "a"]);
    }
}
