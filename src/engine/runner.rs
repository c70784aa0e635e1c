mod diagnostics;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::mpsc::channel;
use std::time::{Duration, Instant};

use petgraph::Direction;
use petgraph::graph::NodeIndex;
use tracing::Level;
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::core::{CancellationToken, Dynamic};
use crate::engine::{Environment, SkipReason, TaskArgs, TaskContext, TaskGraph, TaskStatus};
use crate::error::{GraphError, TaskError};

pub use diagnostics::{RunReport, TaskReport};

type Completion = (NodeIndex, anyhow::Result<Dynamic>, Instant, Duration);

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("Task panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("Task panicked: {s}")
    } else {
        String::from("Task panicked with unknown payload")
    }
}

/// Runs `target` and everything it depends on.
///
/// Tasks run on the rayon pool as soon as their last dependency succeeds,
/// so independent branches overlap. A failed task stops only its
/// dependents; they are reported as skipped, blocked by the failure.
/// Cancelling stops new tasks from starting; tasks already running are
/// allowed to finish.
pub(crate) fn run(
    graph: &TaskGraph,
    target: &str,
    args: &TaskArgs,
    env: &Environment,
    cancel: &CancellationToken,
) -> Result<RunReport, GraphError> {
    let order = graph.closure_order(target)?;
    let closure: HashSet<NodeIndex> = order.iter().copied().collect();

    let mut dependency_counts: HashMap<NodeIndex, usize> = order
        .iter()
        .map(|&i| {
            let count = graph
                .graph
                .neighbors_directed(i, Direction::Incoming)
                .filter(|dep| closure.contains(dep))
                .count();
            (i, count)
        })
        .collect();

    let mut statuses: HashMap<NodeIndex, TaskStatus> =
        order.iter().map(|&i| (i, TaskStatus::Pending)).collect();
    let mut durations: HashMap<NodeIndex, Duration> = HashMap::new();
    let mut outputs: HashMap<NodeIndex, Dynamic> = HashMap::new();

    let root_span = tracing::span!(Level::INFO, "run", task = %target);
    root_span.pb_set_length(order.len() as u64);
    if let Ok(style) = crate::utils::get_style_root() {
        root_span.pb_set_style(&style);
    }
    root_span.pb_set_message(&format!("Running {target}"));
    let _enter = root_span.enter();

    let task_style = crate::utils::get_style_task().ok();
    let start = Instant::now();

    // On the only worker of a pool, nothing else could pick up spawned work
    // while this thread waits for completions, so tasks run inline instead.
    let inline = rayon::current_thread_index().is_some() && rayon::current_num_threads() == 1;

    rayon::in_place_scope(|s| {
        let (sender, receiver) = channel::<Completion>();

        let spawn_task = |outputs: &HashMap<NodeIndex, Dynamic>, index: NodeIndex| {
            let definition = graph.graph[index].clone();

            let dependencies: HashMap<String, Dynamic> = graph
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter_map(|dep| Some((graph.graph[dep].name.clone(), outputs.get(&dep)?.clone())))
                .collect();

            let sender = sender.clone();
            let task_style = task_style.clone();

            let job = move || {
                let span = tracing::span!(Level::INFO, "task", name = %definition.name);
                if let Some(style) = &task_style {
                    span.pb_set_style(style);
                }
                span.pb_set_message(&format!("Running {}", definition.name));
                let _enter = span.enter();

                let context = TaskContext {
                    definition: &definition,
                    args,
                    env,
                    outputs: &dependencies,
                    cancel,
                    span: span.clone(),
                };

                let start_time = Instant::now();

                // Outputs and the shared environment are immutable, so a
                // panicking action leaves nothing half-updated behind.
                let output = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    (definition.action)(&context)
                })) {
                    Ok(result) => result,
                    Err(panic) => Err(anyhow::anyhow!(panic_message(panic))),
                };

                let _ = sender.send((index, output, start_time, start_time.elapsed()));
            };

            if inline {
                job();
            } else {
                s.spawn(move |_| job());
            }
        };

        let mut in_flight = 0usize;

        for &index in &order {
            if dependency_counts[&index] == 0 && !cancel.is_cancelled() {
                statuses.insert(index, TaskStatus::Running);
                spawn_task(&outputs, index);
                in_flight += 1;
            }
        }

        while in_flight > 0 {
            // This thread only schedules; task bodies never run on it unless
            // the pool has no other worker.
            let Ok((index, output, _, duration)) = receiver.recv() else {
                break;
            };

            in_flight -= 1;
            durations.insert(index, duration);
            root_span.pb_inc(1);

            let name = &graph.graph[index].name;

            match output {
                Ok(output) => {
                    tracing::debug!(task = %name, ?duration, "task succeeded");
                    outputs.insert(index, output);
                    statuses.insert(index, TaskStatus::Succeeded);

                    for dependent in graph.graph.neighbors_directed(index, Direction::Outgoing) {
                        let Some(count) = dependency_counts.get_mut(&dependent) else {
                            continue;
                        };

                        *count -= 1;
                        if *count == 0 && !cancel.is_cancelled() {
                            statuses.insert(dependent, TaskStatus::Running);
                            spawn_task(&outputs, dependent);
                            in_flight += 1;
                        }
                    }
                }
                Err(_) if cancel.is_cancelled() => {
                    tracing::debug!(task = %name, "task failed after cancellation");
                    statuses.insert(index, TaskStatus::Skipped(SkipReason::Cancelled));
                }
                Err(cause) => {
                    tracing::error!(task = %name, "{cause:#}");
                    statuses.insert(
                        index,
                        TaskStatus::Failed(TaskError {
                            task: name.clone(),
                            cause: Arc::new(cause),
                        }),
                    );
                }
            }
        }
    });

    // Whatever never started was either cut off by cancellation or sits
    // downstream of a failure.
    for &index in &order {
        if !matches!(statuses[&index], TaskStatus::Pending | TaskStatus::Running) {
            continue;
        }

        let reason = match cancel.is_cancelled() {
            true => SkipReason::Cancelled,
            false => graph
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .filter(|dep| closure.contains(dep))
                .find_map(|dep| match &statuses[&dep] {
                    TaskStatus::Failed(err) => Some(SkipReason::BlockedBy(err.task.clone())),
                    TaskStatus::Skipped(reason) => Some(reason.clone()),
                    _ => None,
                })
                .unwrap_or(SkipReason::Cancelled),
        };

        statuses.insert(index, TaskStatus::Skipped(reason));
    }

    let entries = order
        .iter()
        .map(|index| TaskReport {
            name: graph.graph[*index].name.clone(),
            status: statuses.remove(index).unwrap_or(TaskStatus::Pending),
            duration: durations.get(index).copied(),
        })
        .collect();

    let report = RunReport {
        target: target.to_owned(),
        entries,
        elapsed: start.elapsed(),
    };

    tracing::info!(
        task = %target,
        succeeded = report.succeeded(),
        "Run finished {}",
        crate::utils::as_overhead(start)
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaskGraphBuilder;
    use crate::error::exit;
    use crate::testing::environment;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn run_target(graph: &TaskGraph, target: &str) -> RunReport {
        run(graph, target, &TaskArgs::new(), &environment(), &CancellationToken::new()).unwrap()
    }

    #[test]
    fn test_failure_propagation() {
        let b_ran = Arc::new(AtomicUsize::new(0));
        let mut builder = TaskGraphBuilder::new();

        builder.define("A").run(|_| -> anyhow::Result<()> { anyhow::bail!("A broke") });
        let counter = b_ran.clone();
        builder.define("B").depends_on("A").run(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        builder.define("C").run(|_| Ok(()));

        let graph = builder.finalize().unwrap();

        let report = run_target(&graph, "B");
        assert!(report.status("A").unwrap().is_failed());
        assert!(matches!(
            report.status("B"),
            Some(TaskStatus::Skipped(SkipReason::BlockedBy(a))) if a == "A"
        ));
        assert_eq!(b_ran.load(Ordering::SeqCst), 0);
        assert_eq!(report.exit_code(), exit::TASK);

        let report = run_target(&graph, "C");
        assert!(report.status("C").unwrap().is_succeeded());
        assert!(report.status("A").is_none());
        assert_eq!(report.exit_code(), exit::SUCCESS);
    }

    #[test]
    fn test_failure_spares_independent_branch() {
        let mut builder = TaskGraphBuilder::new();
        builder.define("A").run(|_| -> anyhow::Result<()> { anyhow::bail!("A broke") });
        builder.define("C").run(|_| Ok(()));
        builder.define("J").depends_on("A").depends_on("C").run(|_| Ok(()));

        let report = run_target(&builder.finalize().unwrap(), "J");
        assert!(report.status("A").unwrap().is_failed());
        assert!(report.status("C").unwrap().is_succeeded());
        assert!(matches!(
            report.status("J"),
            Some(TaskStatus::Skipped(SkipReason::BlockedBy(a))) if a == "A"
        ));
        assert_eq!(report.exit_code(), exit::TASK);
    }

    #[test]
    fn test_skips_are_transitive() {
        let mut builder = TaskGraphBuilder::new();
        builder.define("A").run(|_| -> anyhow::Result<()> { anyhow::bail!("no") });
        builder.define("B").depends_on("A").run(|_| Ok(()));
        builder.define("C").depends_on("B").run(|_| Ok(()));

        let report = run_target(&builder.finalize().unwrap(), "C");
        assert!(matches!(
            report.status("C"),
            Some(TaskStatus::Skipped(SkipReason::BlockedBy(a))) if a == "A"
        ));
    }

    #[test]
    fn test_dependency_outputs() {
        let mut builder = TaskGraphBuilder::new();
        builder.define("answer").run(|_| Ok(42u32));
        builder.define("double").depends_on("answer").run(|ctx| {
            let answer = ctx.dependency::<u32>("answer")?;
            anyhow::ensure!(ctx.dependency::<String>("answer").is_err());
            anyhow::ensure!(ctx.dependency::<u32>("double").is_err());
            Ok(answer * 2)
        });

        let report = run_target(&builder.finalize().unwrap(), "double");
        assert!(report.succeeded(), "{report}");
    }

    #[test]
    fn test_dependencies_run_first() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = TaskGraphBuilder::new();

        for (name, deps) in [("compile", vec![]), ("test", vec!["compile"]), ("deploy", vec!["compile", "test"])] {
            let log = log.clone();
            let mut def = builder.define(name);
            for dep in deps {
                def = def.depends_on(dep);
            }
            def.run(move |ctx| {
                log.lock().unwrap().push(ctx.name().to_owned());
                Ok(())
            });
        }

        let report = run_target(&builder.finalize().unwrap(), "deploy");
        assert!(report.succeeded());
        assert_eq!(*log.lock().unwrap(), vec!["compile", "test", "deploy"]);
    }

    #[test]
    fn test_super_chain_runs_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut builder = TaskGraphBuilder::new();

        let l = log.clone();
        builder.define("compile").run(move |_| {
            l.lock().unwrap().push("base");
            Ok(1u32)
        });

        let l = log.clone();
        builder.override_task("compile").run(move |ctx| {
            l.lock().unwrap().push("first");
            Ok(*ctx.run_super::<u32>()? + 10)
        });

        let l = log.clone();
        builder.override_task("compile").run(move |ctx| {
            l.lock().unwrap().push("second");
            Ok(*ctx.run_super::<u32>()? + 100)
        });

        builder.define("check").depends_on("compile").run(|ctx| {
            anyhow::ensure!(*ctx.dependency::<u32>("compile")? == 111);
            Ok(())
        });

        let report = run_target(&builder.finalize().unwrap(), "check");
        assert!(report.succeeded(), "{report}");
        assert_eq!(*log.lock().unwrap(), vec!["second", "first", "base"]);
    }

    #[test]
    fn test_super_without_prior_fails() {
        let mut builder = TaskGraphBuilder::new();
        builder.define("A").run(|ctx| ctx.run_super::<()>().map(|_| ()));
        let report = run_target(&builder.finalize().unwrap(), "A");
        assert!(report.status("A").unwrap().is_failed());
    }

    #[test]
    fn test_panic_is_a_failure() {
        let mut builder = TaskGraphBuilder::new();
        builder.define("A").run(|_| -> anyhow::Result<()> { panic!("kaboom") });
        let report = run_target(&builder.finalize().unwrap(), "A");

        let Some(TaskStatus::Failed(err)) = report.status("A") else {
            panic!("expected failure");
        };
        assert!(err.cause.to_string().contains("kaboom"));
    }

    #[test]
    fn test_cancellation_skips_the_rest() {
        let cancel = CancellationToken::new();
        let mut builder = TaskGraphBuilder::new();

        let token = cancel.clone();
        builder.define("A").run(move |_| {
            token.cancel();
            Ok(())
        });
        builder.define("B").depends_on("A").run(|_| Ok(()));
        builder.define("C").depends_on("B").run(|_| Ok(()));

        let graph = builder.finalize().unwrap();
        let report = run(&graph, "C", &TaskArgs::new(), &environment(), &cancel).unwrap();

        assert!(report.status("A").unwrap().is_succeeded());
        for task in ["B", "C"] {
            assert!(matches!(
                report.status(task),
                Some(TaskStatus::Skipped(SkipReason::Cancelled))
            ));
        }
        assert_eq!(report.exit_code(), exit::CANCELLED);
    }

    #[test]
    fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let ran = Arc::new(AtomicUsize::new(0));
        let mut builder = TaskGraphBuilder::new();
        let counter = ran.clone();
        builder.define("A").run(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let graph = builder.finalize().unwrap();
        let report = run(&graph, "A", &TaskArgs::new(), &environment(), &cancel).unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(report.status("A").unwrap().is_skipped());
    }

    #[test]
    fn test_independent_branches_overlap() {
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let mut builder = TaskGraphBuilder::new();

        for name in ["left", "right"] {
            let barrier = barrier.clone();
            builder.define(name).run(move |_| {
                // Only returns if both branches are running at once.
                barrier.wait();
                Ok(())
            });
        }
        builder.define("join").depends_on("left").depends_on("right").run(|_| Ok(()));

        // Needs two workers besides the scheduler thread.
        let pool = rayon::ThreadPoolBuilder::new().num_threads(3).build().unwrap();
        let report = pool.install(|| run_target(&builder.finalize().unwrap(), "join"));
        assert!(report.succeeded());
    }

    #[test]
    fn test_slow_task_does_not_hold_back_other_branches() {
        let started = Arc::new(Mutex::new(None));
        let mut builder = TaskGraphBuilder::new();

        builder.define("fast").run(|_| Ok(()));
        builder.define("slow").run(|_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        let at = started.clone();
        builder.define("after_fast").depends_on("fast").run(move |_| {
            *at.lock().unwrap() = Some(Instant::now());
            Ok(())
        });
        builder
            .define("join")
            .depends_on("slow")
            .depends_on("after_fast")
            .run(|_| Ok(()));

        let graph = builder.finalize().unwrap();
        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();

        let begin = Instant::now();
        let report = pool.install(|| run_target(&graph, "join"));
        assert!(report.succeeded(), "{report}");

        let waited = started.lock().unwrap().unwrap() - begin;
        assert!(waited < Duration::from_millis(250), "after_fast started after {waited:?}");
    }

    #[test]
    fn test_single_worker_does_not_deadlock() {
        let mut builder = TaskGraphBuilder::new();
        builder.define("A").run(|_| Ok(()));
        builder.define("B").depends_on("A").run(|_| Ok(()));

        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        let report = pool.install(|| run_target(&builder.finalize().unwrap(), "B"));
        assert!(report.succeeded());
    }

    #[test]
    fn test_task_args() {
        let mut builder = TaskGraphBuilder::new();
        builder.define("verify").run(|ctx| {
            anyhow::ensure!(ctx.arg("contract") == Some("Counter"));
            anyhow::ensure!(ctx.require_arg("address").is_err());
            Ok(())
        });

        let args = TaskArgs::from([("contract".to_string(), "Counter".to_string())]);
        let graph = builder.finalize().unwrap();
        let report = run(&graph, "verify", &args, &environment(), &CancellationToken::new()).unwrap();
        assert!(report.succeeded(), "{report}");
    }
}
