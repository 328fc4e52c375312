//! Scenario tests for the dependency-ordered convergence
//! machinery, driven entirely through the public API with no
//! engine attached.

use std::{
  collections::HashMap,
  sync::{
    Mutex,
    atomic::{AtomicUsize, Ordering},
  },
  time::{Duration, Instant},
};

use caravel_engine::{
  convergence::plan_service,
  graph::{Direction, ServiceGraph},
  hash::service_hash,
};
use caravel_model::{
  Condition, Container, ContainerState, DependsOn, Project,
  RecreatePolicy, Service, error_kind, labels,
};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_test_writer()
    .try_init();
}

fn project(edges: &[(&str, &[&str])]) -> Project {
  let mut project = Project {
    name: "app".to_string(),
    ..Default::default()
  };
  for (name, deps) in edges {
    let mut service = Service {
      name: name.to_string(),
      image: Some("busybox".to_string()),
      ..Default::default()
    };
    for dep in *deps {
      service.depends_on.insert(
        dep.to_string(),
        DependsOn {
          condition: Condition::Started,
          ..Default::default()
        },
      );
    }
    project.services.insert(name.to_string(), service);
  }
  project
}

#[tokio::test]
async fn linear_startup_and_shutdown_order() {
  init_tracing();
  // a -> b -> c: c converges first on the way up,
  // a stops first on the way down.
  let project =
    project(&[("a", &["b"]), ("b", &["c"]), ("c", &[])]);
  let graph = ServiceGraph::build(&project).unwrap();

  let spans: Mutex<HashMap<String, (Instant, Instant)>> =
    Mutex::new(HashMap::new());
  let spans_ref = &spans;
  graph
    .walk(
      Direction::Forward,
      None,
      None,
      &CancellationToken::new(),
      |name| async move {
        let begin = Instant::now();
        tokio::time::sleep(Duration::from_millis(5)).await;
        spans_ref
          .lock()
          .unwrap()
          .insert(name, (begin, Instant::now()));
        Ok(())
      },
    )
    .await
    .unwrap();

  let spans = spans.into_inner().unwrap();
  // A visit begins strictly after all its dependencies end.
  assert!(spans["b"].0 >= spans["c"].1);
  assert!(spans["a"].0 >= spans["b"].1);

  let order = Mutex::new(Vec::new());
  let order_ref = &order;
  graph
    .walk(
      Direction::Reverse,
      None,
      None,
      &CancellationToken::new(),
      |name| async move {
        order_ref.lock().unwrap().push(name);
        Ok(())
      },
    )
    .await
    .unwrap();
  assert_eq!(order.into_inner().unwrap(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn siblings_overlap_unless_serialised() {
  init_tracing();
  let project = project(&[
    ("a", &["b", "c"]),
    ("b", &[]),
    ("c", &[]),
  ]);
  let graph = ServiceGraph::build(&project).unwrap();

  let in_flight = AtomicUsize::new(0);
  let peak = AtomicUsize::new(0);
  let (in_flight_ref, peak_ref) = (&in_flight, &peak);
  let graph = &graph;
  let observe = |limit: Option<usize>| async move {
    in_flight_ref.store(0, Ordering::SeqCst);
    peak_ref.store(0, Ordering::SeqCst);
    graph
      .walk(
        Direction::Forward,
        None,
        limit,
        &CancellationToken::new(),
        |_| async move {
          let now = in_flight_ref
            .fetch_add(1, Ordering::SeqCst)
            + 1;
          peak_ref.fetch_max(now, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(10))
            .await;
          in_flight_ref.fetch_sub(1, Ordering::SeqCst);
          Ok(())
        },
      )
      .await
      .unwrap();
    peak_ref.load(Ordering::SeqCst)
  };

  // b and c run together when unbounded.
  assert_eq!(observe(None).await, 2);
  // ... and strictly one at a time under max_concurrency 1.
  assert_eq!(observe(Some(1)).await, 1);
}

#[tokio::test]
async fn cycles_are_rejected_before_any_work() {
  init_tracing();
  let project = project(&[("a", &["b"]), ("b", &["a"])]);
  let err = ServiceGraph::build(&project).unwrap_err();
  match error_kind(&err) {
    Some(caravel_model::Error::Cycle { path }) => {
      assert_eq!(path, "a -> b -> a");
    }
    other => panic!("expected cycle, got {other:?}"),
  }
}

#[test]
fn reapplying_an_unchanged_project_plans_no_work() {
  // Containers labelled with the current config hash and
  // contiguous numbers make every service plan a no-op.
  let project = project(&[
    ("web", &["db"]),
    ("db", &[]),
  ]);
  for (name, service) in &project.services {
    let hash = service_hash(service).unwrap();
    let observed: Vec<Container> = (1..=service.scale())
      .map(|number| {
        let mut container = Container {
          id: format!("{name}-{number}"),
          name: format!("app-{name}-{number}"),
          state: ContainerState::Running,
          created: number as i64,
          ..Default::default()
        };
        container.labels.insert(
          labels::CONFIG_HASH.to_string(),
          hash.clone(),
        );
        container.labels.insert(
          labels::CONTAINER_NUMBER.to_string(),
          number.to_string(),
        );
        container
      })
      .collect();

    let plan = plan_service(
      service,
      &observed,
      RecreatePolicy::Auto,
    )
    .unwrap();
    assert!(plan.is_noop(), "{name} planned work");
    assert_eq!(plan.running.len(), service.scale());
  }
}

#[test]
fn scale_settles_to_contiguous_numbers() {
  let mut project = project(&[("web", &[])]);
  let web = project.services.get_mut("web").unwrap();
  web.replicas = Some(3);
  let hash = service_hash(web).unwrap();

  // One survivor with number 2: two more get created with
  // fresh numbers above the observed maximum.
  let mut survivor = Container {
    id: "web-2".to_string(),
    name: "app-web-2".to_string(),
    state: ContainerState::Running,
    created: 2,
    ..Default::default()
  };
  survivor
    .labels
    .insert(labels::CONFIG_HASH.to_string(), hash);
  survivor.labels.insert(
    labels::CONTAINER_NUMBER.to_string(),
    "2".to_string(),
  );

  let plan = plan_service(
    project.services.get("web").unwrap(),
    &[survivor],
    RecreatePolicy::Auto,
  )
  .unwrap();
  assert_eq!(plan.create_numbers, vec![3, 4]);
  assert!(plan.scale_down.is_empty());
}
