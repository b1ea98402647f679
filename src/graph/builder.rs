//! Construction of the resource dependency graph.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::context::RunContext;
use crate::error::GraphError;
use crate::model::{Lifecycle, Resource, Value, schema_for};

/// Directed acyclic graph of declared resources.
///
/// An edge `a -> b` means `a` references an output of `b`, so `b` must be
/// applied first.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    /// Resources in declaration order.
    nodes: Vec<Resource>,
    /// Name to node index.
    index: HashMap<String, usize>,
    /// Per node, the nodes it references.
    dependencies: Vec<BTreeSet<usize>>,
    /// Per node, the nodes that reference it.
    dependents: Vec<BTreeSet<usize>>,
    /// Topological order, dependencies first.
    order: Vec<usize>,
}

/// Builds [`ResourceGraph`]s from declared resources.
#[derive(Debug, Default)]
pub struct GraphBuilder;

impl GraphBuilder {
    /// Creates a new graph builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates the declared resources and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] for duplicate names, schema violations,
    /// references to undeclared resources or unknown outputs, and cycles.
    pub fn build(
        &self,
        ctx: &mut RunContext,
        resources: Vec<Resource>,
    ) -> Result<ResourceGraph, GraphError> {
        let mut index = HashMap::with_capacity(resources.len());
        for (i, resource) in resources.iter().enumerate() {
            if index.insert(resource.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateName {
                    name: resource.name.clone(),
                });
            }
            schema_for(resource.kind).validate(resource)?;
        }

        let mut dependencies = vec![BTreeSet::new(); resources.len()];
        let mut dependents = vec![BTreeSet::new(); resources.len()];

        for (i, resource) in resources.iter().enumerate() {
            for (property, value) in &resource.properties {
                let mut refs = Vec::new();
                value.collect_references(&mut refs);

                for reference in refs {
                    let Some(&target) = index.get(&reference.resource) else {
                        return Err(GraphError::DanglingReference {
                            resource: resource.name.clone(),
                            target: reference.resource,
                        });
                    };

                    let target_kind = resources[target].kind;
                    if !schema_for(target_kind).has_output(&reference.output) {
                        return Err(GraphError::Schema {
                            resource: resource.name.clone(),
                            kind: resource.kind.to_string(),
                            property: property.clone(),
                            message: format!(
                                "{target_kind} '{}' has no output '{}'",
                                reference.resource, reference.output
                            ),
                        });
                    }

                    dependencies[i].insert(target);
                    dependents[target].insert(i);
                }
            }
        }

        if let Some(cycle) = find_cycle(&dependencies) {
            let cycle: Vec<String> = cycle
                .into_iter()
                .map(|i| resources[i].name.clone())
                .collect();
            return Err(GraphError::Cycle { cycle });
        }

        let order = topological_order(&dependencies, &dependents);

        let mut nodes = resources;
        for node in &mut nodes {
            node.lifecycle = Lifecycle::Declared;
            ctx.set_lifecycle(&node.name, Lifecycle::Declared);
        }

        debug!(
            "Built resource graph: {} nodes, {} edges",
            nodes.len(),
            dependencies.iter().map(BTreeSet::len).sum::<usize>()
        );

        Ok(ResourceGraph {
            nodes,
            index,
            dependencies,
            dependents,
            order,
        })
    }
}

/// Finds a cycle with a depth-first search that marks the recursion stack.
///
/// Returns the cycle's members in traversal order, closed by repeating the
/// first member.
fn find_cycle(dependencies: &[BTreeSet<usize>]) -> Option<Vec<usize>> {
    let mut visited = vec![false; dependencies.len()];
    let mut on_stack = vec![false; dependencies.len()];
    let mut path = Vec::new();

    (0..dependencies.len()).find_map(|start| {
        if visited[start] {
            None
        } else {
            dfs_cycle(dependencies, start, &mut visited, &mut on_stack, &mut path)
        }
    })
}

fn dfs_cycle(
    dependencies: &[BTreeSet<usize>],
    node: usize,
    visited: &mut [bool],
    on_stack: &mut [bool],
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited[node] = true;
    on_stack[node] = true;
    path.push(node);

    for &dep in &dependencies[node] {
        if on_stack[dep] {
            let start = path.iter().position(|&n| n == dep).unwrap_or(0);
            let mut cycle = path[start..].to_vec();
            cycle.push(dep);
            return Some(cycle);
        }
        if !visited[dep] {
            if let Some(cycle) = dfs_cycle(dependencies, dep, visited, on_stack, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    on_stack[node] = false;
    None
}

/// Kahn's algorithm; among ready nodes the earliest declared goes first.
fn topological_order(dependencies: &[BTreeSet<usize>], dependents: &[BTreeSet<usize>]) -> Vec<usize> {
    let mut remaining: Vec<usize> = dependencies.iter().map(BTreeSet::len).collect();
    let mut ready: BTreeSet<usize> = remaining
        .iter()
        .enumerate()
        .filter(|(_, n)| **n == 0)
        .map(|(i, _)| i)
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());

    while let Some(node) = ready.pop_first() {
        order.push(node);
        for &dependent in &dependents[node] {
            remaining[dependent] -= 1;
            if remaining[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    order
}

impl ResourceGraph {
    /// Number of resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if nothing is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Looks up a resource by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Resource> {
        self.index.get(name).map(|&i| &self.nodes[i])
    }

    /// Returns true if a resource with this name is declared.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Resources in declaration order.
    #[must_use]
    pub fn resources(&self) -> &[Resource] {
        &self.nodes
    }

    /// Resources in topological order, dependencies first.
    pub fn topological_order(&self) -> impl Iterator<Item = &Resource> + '_ {
        self.order.iter().map(|&i| &self.nodes[i])
    }

    /// Checks that every stack output references an output of a declared
    /// resource.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Output`] for the first offending output.
    pub fn check_outputs(&self, outputs: &BTreeMap<String, Value>) -> Result<(), GraphError> {
        for (name, value) in outputs {
            let mut refs = Vec::new();
            value.collect_references(&mut refs);

            for reference in refs {
                let Some(resource) = self.get(&reference.resource) else {
                    return Err(GraphError::Output {
                        output: name.clone(),
                        message: format!("undeclared resource '{}'", reference.resource),
                    });
                };
                if !schema_for(resource.kind).has_output(&reference.output) {
                    return Err(GraphError::Output {
                        output: name.clone(),
                        message: format!(
                            "{} '{}' has no output '{}'",
                            resource.kind, reference.resource, reference.output
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Names of the resources `name` references, in declaration order.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependencies)
    }

    /// Names of the resources that reference `name`, in declaration order.
    #[must_use]
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, &self.dependents)
    }

    fn neighbours<'a>(&'a self, name: &str, edges: &'a [BTreeSet<usize>]) -> Vec<&'a str> {
        self.index.get(name).map_or_else(Vec::new, |&i| {
            edges[i]
                .iter()
                .map(|&j| self.nodes[j].name.as_str())
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;

    fn network(name: &str) -> Resource {
        Resource::new(name, ResourceKind::Network)
    }

    fn firewall(name: &str, network: &str) -> Resource {
        Resource::new(name, ResourceKind::Firewall)
            .with_property("network", format!("${{{network}.id}}").as_str())
            .with_property("allows", Value::List(vec![]))
    }

    fn build(resources: Vec<Resource>) -> Result<ResourceGraph, GraphError> {
        let mut ctx = RunContext::new("test", "dev");
        GraphBuilder::new().build(&mut ctx, resources)
    }

    fn names(graph: &ResourceGraph) -> Vec<&str> {
        graph.topological_order().map(|r| r.name.as_str()).collect()
    }

    #[test]
    fn test_dependencies_come_first() {
        let graph = build(vec![firewall("fw", "net"), network("net")]).expect("graph");

        assert_eq!(names(&graph), vec!["net", "fw"]);
        assert_eq!(graph.dependencies_of("fw"), vec!["net"]);
        assert_eq!(graph.dependents_of("net"), vec!["fw"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let graph = build(vec![
            network("b"),
            network("a"),
            firewall("fw-b", "b"),
            network("c"),
            firewall("fw-a", "a"),
        ])
        .expect("graph");

        assert_eq!(names(&graph), vec!["b", "a", "fw-b", "c", "fw-a"]);
    }

    #[test]
    fn test_order_is_valid_for_every_edge() {
        let disk = Resource::new("disk", ResourceKind::Disk).with_property("zone", "us-east1-b");
        let addr = Resource::new("addr", ResourceKind::Address).with_property("region", "us-east1");
        let vm: Resource = serde_yaml::from_str::<crate::model::Properties>(
            r#"
zone: us-east1-b
machine_type: n1-standard-1
boot_disk: { source: "${disk.id}" }
network_interfaces:
  - network: "${net.id}"
    access_configs: [{ nat_ip: "${addr.address}" }]
"#,
        )
        .map(|properties| Resource {
            properties,
            ..Resource::new("vm", ResourceKind::Instance)
        })
        .expect("vm");

        let graph = build(vec![vm, firewall("fw", "net"), disk, network("net"), addr])
            .expect("graph");
        let order = names(&graph);

        for resource in graph.resources() {
            let pos = order.iter().position(|n| *n == resource.name).expect("present");
            for dep in graph.dependencies_of(&resource.name) {
                let dep_pos = order.iter().position(|n| *n == dep).expect("present");
                assert!(dep_pos < pos, "{dep} must precede {}", resource.name);
            }
        }
    }

    #[test]
    fn test_cycle_is_reported() {
        let a = Resource::new("a", ResourceKind::Firewall)
            .with_property("network", "${b.id}")
            .with_property("allows", Value::List(vec![]));
        let b = Resource::new("b", ResourceKind::Firewall)
            .with_property("network", "${a.id}")
            .with_property("allows", Value::List(vec![]));

        let err = build(vec![a, b, network("n")]).expect_err("cycle");
        let GraphError::Cycle { cycle } = err else {
            panic!("expected a cycle error, got {err:?}");
        };
        assert!(cycle.contains(&String::from("a")));
        assert!(cycle.contains(&String::from("b")));
        assert!(!cycle.contains(&String::from("n")));
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let fw = Resource::new("fw", ResourceKind::Firewall)
            .with_property("network", "${fw.id}")
            .with_property("allows", Value::List(vec![]));

        let err = build(vec![fw]).expect_err("cycle");
        assert!(matches!(err, GraphError::Cycle { ref cycle } if cycle == &["fw", "fw"]));
    }

    #[test]
    fn test_dangling_reference() {
        let err = build(vec![firewall("fw", "missing")]).expect_err("dangling");
        assert!(matches!(
            err,
            GraphError::DanglingReference { ref resource, ref target }
                if resource == "fw" && target == "missing"
        ));
    }

    #[test]
    fn test_unknown_output() {
        let fw = Resource::new("fw", ResourceKind::Firewall)
            .with_property("network", "${net.address}")
            .with_property("allows", Value::List(vec![]));

        let err = build(vec![network("net"), fw]).expect_err("unknown output");
        assert!(matches!(err, GraphError::Schema { ref property, .. } if property == "network"));
    }

    #[test]
    fn test_duplicate_name() {
        let err = build(vec![network("net"), network("net")]).expect_err("duplicate");
        assert!(matches!(err, GraphError::DuplicateName { ref name } if name == "net"));
    }

    #[test]
    fn test_stack_outputs_are_checked() {
        let graph = build(vec![network("net")]).expect("graph");
        let outputs = |value: &str| BTreeMap::from([("exported".to_string(), Value::from(value))]);

        assert!(graph.check_outputs(&outputs("${net.self_link}")).is_ok());
        assert!(graph.check_outputs(&outputs("plain text")).is_ok());

        let err = graph.check_outputs(&outputs("${vm.name}")).expect_err("undeclared");
        assert!(matches!(
            err,
            GraphError::Output { ref output, ref message } if output == "exported" && message.contains("'vm'")
        ));

        let err = graph.check_outputs(&outputs("${net.address}")).expect_err("unknown output");
        assert!(matches!(err, GraphError::Output { ref message, .. } if message.contains("address")));
    }

    #[test]
    fn test_lifecycle_marked_declared() {
        let mut ctx = RunContext::new("test", "dev");
        let graph = GraphBuilder::new()
            .build(&mut ctx, vec![network("net")])
            .expect("graph");

        assert_eq!(ctx.lifecycle("net"), Some(Lifecycle::Declared));
        assert_eq!(graph.get("net").map(|r| r.lifecycle), Some(Lifecycle::Declared));
        assert!(graph.contains("net"));
        assert_eq!(graph.len(), 1);
    }
}
