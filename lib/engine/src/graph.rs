//! Service dependency graph: construction from the declared
//! project (explicit `depends_on` edges plus implicit edges from
//! shared namespaces and `volumes_from`), cycle detection, and
//! dependency-ordered concurrent traversal.

use std::{
  collections::{HashMap, HashSet, VecDeque},
  future::Future,
};

use anyhow::Context;
use caravel_model::{Error, Project};
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

/// Which way a traversal moves through the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// Dependencies first: starts at services with no
  /// dependencies, finishes at the roots. Startup.
  Forward,
  /// Dependents first: starts at the roots, finishes at
  /// services with no dependencies. Shutdown.
  Reverse,
}

#[derive(Debug)]
struct Vertex {
  name: String,
  /// Outgoing edges: services this one depends on.
  dependencies: Vec<usize>,
  /// Incoming edges: services depending on this one.
  dependents: Vec<usize>,
}

#[derive(Debug)]
pub struct ServiceGraph {
  vertices: Vec<Vertex>,
  index: HashMap<String, usize>,
}

impl ServiceGraph {
  /// Build and validate the graph for a project.
  ///
  /// A `depends_on` target that is undeclared or disabled drops
  /// the edge when the dependency is optional and fails
  /// otherwise, naming the profiles that would enable a
  /// disabled target. Implicit references (shared namespaces,
  /// `volumes_from`) are always required.
  pub fn build(
    project: &Project,
  ) -> anyhow::Result<ServiceGraph> {
    let mut graph = ServiceGraph {
      vertices: Vec::with_capacity(project.services.len()),
      index: HashMap::with_capacity(project.services.len()),
    };
    for name in project.services.keys() {
      graph.index.insert(name.clone(), graph.vertices.len());
      graph.vertices.push(Vertex {
        name: name.clone(),
        dependencies: Vec::new(),
        dependents: Vec::new(),
      });
    }

    for (name, service) in &project.services {
      let from = graph.index[name];
      for (target, dep) in &service.depends_on {
        match graph.index.get(target) {
          Some(&to) => graph.add_edge(from, to),
          None if dep.required => {
            return Err(missing_dependency(
              project, name, target,
            ));
          }
          None => {
            tracing::warn!(
              "service {name}: optional dependency \
               {target} is not declared, ignoring"
            );
          }
        }
      }
      for target in implicit_dependencies(service) {
        if service.depends_on.contains_key(target) {
          continue;
        }
        match graph.index.get(target) {
          Some(&to) => graph.add_edge(from, to),
          None => {
            return Err(missing_dependency(
              project, name, target,
            ));
          }
        }
      }
    }

    if let Some(path) = graph.find_cycle() {
      return Err(Error::Cycle { path }.into());
    }

    Ok(graph)
  }

  fn add_edge(&mut self, from: usize, to: usize) {
    // Duplicate edges collapse. Self edges are kept so cycle
    // detection reports them.
    if from != to
      && self.vertices[from].dependencies.contains(&to)
    {
      return;
    }
    self.vertices[from].dependencies.push(to);
    self.vertices[to].dependents.push(from);
  }

  pub fn len(&self) -> usize {
    self.vertices.len()
  }

  pub fn is_empty(&self) -> bool {
    self.vertices.is_empty()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.index.contains_key(name)
  }

  /// Direct dependents of a service.
  pub fn dependents_of(&self, name: &str) -> Vec<String> {
    self
      .index
      .get(name)
      .map(|&v| {
        self.vertices[v]
          .dependents
          .iter()
          .map(|&u| self.vertices[u].name.clone())
          .collect()
      })
      .unwrap_or_default()
  }

  /// The selected services plus everything they transitively
  /// depend on. Traversal scope for startup of a selection.
  pub fn with_dependencies(
    &self,
    selected: &[String],
  ) -> anyhow::Result<HashSet<String>> {
    self.closure(selected, Direction::Forward)
  }

  /// The selected services plus everything that transitively
  /// depends on them. Traversal scope for stopping a selection.
  pub fn with_dependents(
    &self,
    selected: &[String],
  ) -> anyhow::Result<HashSet<String>> {
    self.closure(selected, Direction::Reverse)
  }

  fn closure(
    &self,
    selected: &[String],
    direction: Direction,
  ) -> anyhow::Result<HashSet<String>> {
    let mut queue = VecDeque::new();
    for name in selected {
      let &v =
        self.index.get(name).with_context(|| {
          Error::NotFound {
            kind: caravel_model::ResourceKind::Service,
            name: name.clone(),
          }
        })?;
      queue.push_back(v);
    }
    let mut out = HashSet::new();
    while let Some(v) = queue.pop_front() {
      if !out.insert(self.vertices[v].name.clone()) {
        continue;
      }
      let next = match direction {
        Direction::Forward => &self.vertices[v].dependencies,
        Direction::Reverse => &self.vertices[v].dependents,
      };
      queue.extend(next.iter().copied());
    }
    Ok(out)
  }

  /// Service names in dependency order (dependencies first).
  /// Reverse the result for shutdown ordering. The graph is
  /// already validated acyclic at build time.
  pub fn sorted(&self) -> Vec<String> {
    let mut pending: Vec<usize> = self
      .vertices
      .iter()
      .map(|v| v.dependencies.len())
      .collect();
    let mut ready: VecDeque<usize> = (0..self.vertices.len())
      .filter(|&v| pending[v] == 0)
      .collect();
    let mut out = Vec::with_capacity(self.vertices.len());
    while let Some(v) = ready.pop_front() {
      out.push(self.vertices[v].name.clone());
      for &u in &self.vertices[v].dependents {
        pending[u] -= 1;
        if pending[u] == 0 {
          ready.push_back(u);
        }
      }
    }
    out
  }

  /// Visit every in-scope service concurrently, each one only
  /// after all its adjacent services in the walking direction
  /// have completed successfully.
  ///
  /// `max_concurrency` bounds in-flight visitors. On visitor
  /// failure, in-flight siblings run to completion, nothing new
  /// is scheduled, and the first error is returned.
  /// Cancellation returns promptly with [Error::Cancelled].
  pub async fn walk<F, Fut>(
    &self,
    direction: Direction,
    scope: Option<&HashSet<String>>,
    max_concurrency: Option<usize>,
    cancel: &CancellationToken,
    visit: F,
  ) -> anyhow::Result<()>
  where
    F: Fn(String) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
  {
    let in_scope: Vec<bool> = self
      .vertices
      .iter()
      .map(|v| {
        scope.is_none_or(|scope| scope.contains(&v.name))
      })
      .collect();
    let total = in_scope.iter().filter(|&&s| s).count();
    if total == 0 {
      return Ok(());
    }
    let limit = max_concurrency.unwrap_or(total).max(1);

    // Number of in-scope adjacent vertices each vertex waits on.
    let mut pending: Vec<usize> = self
      .vertices
      .iter()
      .map(|v| {
        let adjacent = match direction {
          Direction::Forward => &v.dependencies,
          Direction::Reverse => &v.dependents,
        };
        adjacent.iter().filter(|&&u| in_scope[u]).count()
      })
      .collect();

    let mut seen: HashSet<usize> = HashSet::new();
    let mut ready: VecDeque<usize> = (0..self.vertices.len())
      .filter(|&v| in_scope[v] && pending[v] == 0)
      .collect();
    seen.extend(ready.iter().copied());

    let visit = &visit;
    let mut in_flight = FuturesUnordered::new();
    let mut first_err: Option<anyhow::Error> = None;

    loop {
      if first_err.is_none() {
        while in_flight.len() < limit {
          let Some(v) = ready.pop_front() else {
            break;
          };
          let name = self.vertices[v].name.clone();
          in_flight.push(async move {
            let result = visit(name.clone())
              .await
              .with_context(|| {
                format!("service {name}")
              });
            (v, result)
          });
        }
      }
      if in_flight.is_empty() {
        break;
      }

      tokio::select! {
        _ = cancel.cancelled() => {
          return Err(Error::Cancelled.into());
        }
        completed = in_flight.next() => {
          let Some((v, result)) = completed else {
            continue;
          };
          match result {
            Ok(()) => {
              let unblocked = match direction {
                Direction::Forward => {
                  &self.vertices[v].dependents
                }
                Direction::Reverse => {
                  &self.vertices[v].dependencies
                }
              };
              for &u in unblocked {
                if !in_scope[u] {
                  continue;
                }
                pending[u] -= 1;
                if pending[u] == 0 && seen.insert(u) {
                  ready.push_back(u);
                }
              }
            }
            Err(err) => {
              if first_err.is_none() {
                first_err = Some(err);
              }
            }
          }
        }
      }
    }

    match first_err {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  /// Colour DFS. Re-entering a discovered vertex closes a
  /// cycle; the offending path is reported root-to-root.
  fn find_cycle(&self) -> Option<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum Colour {
      Unvisited,
      Discovered,
      Finished,
    }

    fn dfs(
      graph: &ServiceGraph,
      v: usize,
      colours: &mut [Colour],
      path: &mut Vec<usize>,
    ) -> Option<usize> {
      colours[v] = Colour::Discovered;
      path.push(v);
      for &u in &graph.vertices[v].dependencies {
        match colours[u] {
          Colour::Discovered => return Some(u),
          Colour::Unvisited => {
            if let Some(entry) =
              dfs(graph, u, colours, path)
            {
              return Some(entry);
            }
          }
          Colour::Finished => {}
        }
      }
      path.pop();
      colours[v] = Colour::Finished;
      None
    }

    let mut colours =
      vec![Colour::Unvisited; self.vertices.len()];
    for v in 0..self.vertices.len() {
      if colours[v] != Colour::Unvisited {
        continue;
      }
      let mut path = Vec::new();
      if let Some(entry) =
        dfs(self, v, &mut colours, &mut path)
      {
        let start = path
          .iter()
          .position(|&p| p == entry)
          .unwrap_or_default();
        let mut names: Vec<&str> = path[start..]
          .iter()
          .map(|&p| self.vertices[p].name.as_str())
          .collect();
        names.push(&self.vertices[entry].name);
        return Some(names.join(" -> "));
      }
    }
    None
  }
}

fn implicit_dependencies(
  service: &caravel_model::Service,
) -> Vec<&str> {
  let mut out: Vec<&str> = [
    service.network_mode_service(),
    service.ipc_service(),
    service.pid_service(),
  ]
  .into_iter()
  .flatten()
  .collect();
  for name in service.volumes_from_services() {
    if !out.contains(&name) {
      out.push(name);
    }
  }
  out
}

fn missing_dependency(
  project: &Project,
  service: &str,
  target: &str,
) -> anyhow::Error {
  let profiles = project.profiles_for_disabled(target);
  let reason = if profiles.is_empty() {
    "not declared".to_string()
  } else {
    format!(
      "disabled, enable profiles: {}",
      profiles.join(", ")
    )
  };
  Error::MissingDependency {
    service: service.to_string(),
    dependency: target.to_string(),
    reason,
  }
  .into()
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use caravel_model::{DependsOn, Service, error_kind};
  use pretty_assertions::assert_eq;

  use super::*;

  fn project(
    edges: &[(&str, &[&str])],
  ) -> Project {
    let mut project = Project::default();
    for (name, deps) in edges {
      let mut service = Service {
        name: name.to_string(),
        ..Default::default()
      };
      for dep in *deps {
        service
          .depends_on
          .insert(dep.to_string(), DependsOn::default());
      }
      project
        .services
        .insert(name.to_string(), service);
    }
    project
  }

  #[test]
  fn cycle_is_reported_with_path() {
    let project =
      project(&[("a", &["b"]), ("b", &["a"])]);
    let err = ServiceGraph::build(&project).unwrap_err();
    match error_kind(&err) {
      Some(Error::Cycle { path }) => {
        assert_eq!(path, "a -> b -> a")
      }
      other => panic!("expected cycle error, got {other:?}"),
    }
  }

  #[test]
  fn missing_required_dependency_fails() {
    let project = project(&[("a", &["ghost"])]);
    let err = ServiceGraph::build(&project).unwrap_err();
    assert!(matches!(
      error_kind(&err),
      Some(Error::MissingDependency { .. })
    ));
  }

  #[test]
  fn missing_optional_dependency_drops_edge() {
    let mut project = project(&[("a", &[])]);
    project
      .services
      .get_mut("a")
      .unwrap()
      .depends_on
      .insert("ghost".to_string(), DependsOn {
        required: false,
        ..Default::default()
      });
    let graph = ServiceGraph::build(&project).unwrap();
    assert_eq!(graph.len(), 1);
  }

  #[test]
  fn implicit_edges_from_namespace_sharing() {
    let mut project =
      project(&[("a", &[]), ("b", &[])]);
    project.services.get_mut("a").unwrap().network_mode =
      Some("service:b".to_string());
    let graph = ServiceGraph::build(&project).unwrap();
    assert_eq!(graph.dependents_of("b"), vec!["a"]);
  }

  #[test]
  fn sorted_puts_dependencies_first() {
    let project = project(&[
      ("a", &["b"]),
      ("b", &["c"]),
      ("c", &[]),
    ]);
    let graph = ServiceGraph::build(&project).unwrap();
    assert_eq!(graph.sorted(), vec!["c", "b", "a"]);
  }

  #[tokio::test]
  async fn forward_walk_visits_in_dependency_order() {
    let project = project(&[
      ("a", &["b"]),
      ("b", &["c"]),
      ("c", &[]),
    ]);
    let graph = ServiceGraph::build(&project).unwrap();
    let order = Mutex::new(Vec::new());
    let sink = &order;
    graph
      .walk(
        Direction::Forward,
        None,
        None,
        &CancellationToken::new(),
        |name| async move {
          sink.lock().unwrap().push(name);
          Ok(())
        },
      )
      .await
      .unwrap();
    assert_eq!(
      order.into_inner().unwrap(),
      vec!["c", "b", "a"]
    );
  }

  #[tokio::test]
  async fn reverse_walk_visits_dependents_first() {
    let project = project(&[
      ("a", &["b"]),
      ("b", &["c"]),
      ("c", &[]),
    ]);
    let graph = ServiceGraph::build(&project).unwrap();
    let order = Mutex::new(Vec::new());
    let sink = &order;
    graph
      .walk(
        Direction::Reverse,
        None,
        None,
        &CancellationToken::new(),
        |name| async move {
          sink.lock().unwrap().push(name);
          Ok(())
        },
      )
      .await
      .unwrap();
    assert_eq!(
      order.into_inner().unwrap(),
      vec!["a", "b", "c"]
    );
  }

  #[tokio::test]
  async fn every_vertex_visited_exactly_once() {
    let project = project(&[
      ("a", &["b", "c"]),
      ("b", &["d"]),
      ("c", &["d"]),
      ("d", &[]),
    ]);
    let graph = ServiceGraph::build(&project).unwrap();
    let visits = Mutex::new(HashMap::new());
    let sink = &visits;
    graph
      .walk(
        Direction::Forward,
        None,
        Some(1),
        &CancellationToken::new(),
        |name| async move {
          *sink
            .lock()
            .unwrap()
            .entry(name)
            .or_insert(0) += 1;
          Ok(())
        },
      )
      .await
      .unwrap();
    let visits = visits.into_inner().unwrap();
    assert_eq!(visits.len(), 4);
    assert!(visits.values().all(|&count| count == 1));
  }

  #[tokio::test]
  async fn scope_restricts_to_dependency_closure() {
    let project = project(&[
      ("a", &["b"]),
      ("b", &[]),
      ("other", &[]),
    ]);
    let graph = ServiceGraph::build(&project).unwrap();
    let scope = graph
      .with_dependencies(&["a".to_string()])
      .unwrap();
    assert_eq!(scope.len(), 2);

    let order = Mutex::new(Vec::new());
    let sink = &order;
    graph
      .walk(
        Direction::Forward,
        Some(&scope),
        None,
        &CancellationToken::new(),
        |name| async move {
          sink.lock().unwrap().push(name);
          Ok(())
        },
      )
      .await
      .unwrap();
    assert_eq!(
      order.into_inner().unwrap(),
      vec!["b", "a"]
    );
  }

  #[tokio::test]
  async fn visitor_failure_stops_scheduling() {
    let project = project(&[
      ("a", &["b"]),
      ("b", &[]),
    ]);
    let graph = ServiceGraph::build(&project).unwrap();
    let visited = Mutex::new(Vec::new());
    let sink = &visited;
    let err = graph
      .walk(
        Direction::Forward,
        None,
        None,
        &CancellationToken::new(),
        |name| async move {
          sink.lock().unwrap().push(name.clone());
          anyhow::bail!("boom in {name}")
        },
      )
      .await
      .unwrap_err();
    assert!(err.to_string().contains("service b"));
    // a never starts because its dependency failed.
    assert_eq!(visited.into_inner().unwrap(), vec!["b"]);
  }

  #[tokio::test]
  async fn cancellation_returns_promptly() {
    let project = project(&[("a", &[])]);
    let graph = ServiceGraph::build(&project).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = graph
      .walk(
        Direction::Forward,
        None,
        None,
        &cancel,
        |_| async {
          std::future::pending::<()>().await;
          Ok(())
        },
      )
      .await
      .unwrap_err();
    assert!(matches!(
      error_kind(&err),
      Some(Error::Cancelled)
    ));
  }
}
