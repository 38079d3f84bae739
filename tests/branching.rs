use specula::{
    CommitStatus, Engine, EngineConfig, ExecutionMode, FixedPredictor, FnOperation, Identifier,
    MemoryBackend, Namespace, OverlapPredictor, identifier_set,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(30);

fn committed(backend: &MemoryBackend, path: &str) -> Option<i64> {
    backend
        .committed_value(Namespace::Persistent, &Identifier::from(path))
        .and_then(|v| v.as_integer())
}

/// Branches forked by failed attempts are discarded, so a retried operation
/// lands its branch writes exactly once.
#[test]
fn retried_forker_commits_each_branch_once() {
    const FANOUT: usize = 3;
    let backend = MemoryBackend::default();
    backend.inject_commit_fault(Identifier::from("forker"), CommitStatus::CURRENT_COLLISION, 2);
    let engine = Engine::new(
        EngineConfig::default()
            .with_parallelism(4)
            .with_admit_interval(Duration::from_micros(200)),
        backend.clone(),
        FixedPredictor::new(ExecutionMode::Optimistic),
    )
    .expect("engine");

    let attempts = Arc::new(AtomicUsize::new(0));
    let forker = FnOperation::new("forker", identifier_set(["forker"]), {
        let attempts = Arc::clone(&attempts);
        move |persistent, _, next| {
            attempts.fetch_add(1, Ordering::SeqCst);
            persistent.increment(&Identifier::from("forker"), 1)?;
            for i in 0..FANOUT {
                let path = format!("forked/{i}");
                next.branch(FnOperation::new(
                    path.clone(),
                    identifier_set([path.as_str()]),
                    move |persistent, _, _| {
                        persistent.increment(&Identifier::from(path.as_str()), 1)?;
                        Ok(())
                    },
                ));
            }
            Ok(())
        }
    });
    engine
        .submit(forker)
        .expect("submit")
        .get_timeout(WAIT)
        .expect("forker committed");
    let stats = engine.stats();
    engine.shutdown().expect("shutdown");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(committed(&backend, "forker"), Some(1));
    for i in 0..FANOUT {
        assert_eq!(committed(&backend, &format!("forked/{i}")), Some(1), "branch {i}");
    }
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.branches_forked, (3 * FANOUT) as u64);
    assert_eq!(stats.abandoned_branches, (2 * FANOUT) as u64);
    assert_eq!(backend.stats().injected_faults, 2);
}

/// Each protected continuation runs once, after both branches of its tree
/// have committed, even when a branch has to retry.
#[test]
fn continuations_observe_their_committed_branch_tree() {
    const ROOTS: usize = 12;
    let backend = MemoryBackend::default();
    backend.inject_commit_fault(Identifier::from("leaf/0/a"), CommitStatus::LATER_COLLISION, 1);
    let engine = Engine::new(
        EngineConfig::default()
            .with_parallelism(4)
            .with_admit_interval(Duration::from_micros(200)),
        backend.clone(),
        OverlapPredictor::default(),
    )
    .expect("engine");

    let handles: Vec<_> = (0..ROOTS)
        .map(|n| {
            let node = format!("node/{n}");
            let op = FnOperation::new(node.clone(), identifier_set([node.as_str()]), {
                move |persistent, _, next| {
                    persistent.put(Identifier::from(node.as_str()), 1_i64)?;
                    for side in ["a", "b"] {
                        let leaf = format!("leaf/{n}/{side}");
                        next.branch(FnOperation::new(
                            leaf.clone(),
                            identifier_set([leaf.as_str()]),
                            move |persistent, _, _| {
                                persistent.increment(&Identifier::from(leaf.as_str()), 1)?;
                                Ok(())
                            },
                        ));
                    }
                    let tree = format!("leaf/{n}");
                    let seen = format!("seen/{n}");
                    next.protect(FnOperation::new(
                        format!("continuation-{n}"),
                        identifier_set(["continuations", tree.as_str(), seen.as_str()]),
                        move |persistent, _, _| {
                            let a = persistent
                                .get_integer(&Identifier::from(format!("{tree}/a").as_str()))?
                                .unwrap_or(0);
                            let b = persistent
                                .get_integer(&Identifier::from(format!("{tree}/b").as_str()))?
                                .unwrap_or(0);
                            persistent.put(Identifier::from(seen.as_str()), a + b)?;
                            persistent.increment(&Identifier::from("continuations"), 1)?;
                            Ok(())
                        },
                    ));
                    Ok(())
                }
            });
            engine.submit(op).expect("submit")
        })
        .collect();
    for handle in handles {
        handle.get_timeout(WAIT).expect("tree committed");
    }
    let stats = engine.stats();
    engine.shutdown().expect("shutdown");

    assert_eq!(committed(&backend, "continuations"), Some(ROOTS as i64));
    assert_eq!(stats.continuations_run, ROOTS as u64);
    for n in 0..ROOTS {
        assert_eq!(committed(&backend, &format!("seen/{n}")), Some(2), "tree {n}");
        assert_eq!(committed(&backend, &format!("leaf/{n}/a")), Some(1));
        assert_eq!(committed(&backend, &format!("leaf/{n}/b")), Some(1));
    }
    assert_eq!(backend.stats().injected_faults, 1);
}
