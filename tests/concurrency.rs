//! Fibers, interruption, races, brackets, and fiber refs under the
//! real executor and timer. Timing assertions use generous margins.

use std::convert::Infallible;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fibra::{Cause, Effect, Exit, FiberRef, Promise, Ref, Runtime};

fn run<A: fibra::Data, E: fibra::Data>(effect: Effect<A, E>) -> Exit<A, E> {
    Runtime::new().run(effect)
}

fn value_of<A: fibra::Data, E: fibra::Data>(exit: Exit<A, E>) -> A {
    match exit {
        Exit::Success(a) => a,
        Exit::Failure(cause) => panic!("unexpected failure: interrupted={}", cause.interrupted()),
    }
}

#[test]
fn fork_join_round_trips_the_value() {
    let exit = run(
        Effect::<i32, String>::total(|| 6 * 7)
            .fork()
            .flat_map(|handle| handle.join()),
    );
    assert_eq!(exit, Exit::Success(42));
}

#[test]
fn interrupting_a_sleeping_fiber_cancels_its_continuation() {
    // A fiber parked on a long sleep never runs its continuation once
    // interrupted; the write stays unobserved.
    let program = Ref::make(true).flat_map(|flag| {
        let flag_in_child = flag.clone();
        Effect::<(), Infallible>::sleep(Duration::from_secs(3600))
            .zip_right(flag_in_child.set(false))
            .fork()
            .flat_map(move |handle| {
                Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                    .zip_right(handle.interrupt())
                    .flat_map(move |exit| {
                        assert!(exit.is_interrupted());
                        flag.get()
                    })
            })
    });

    let exit = run(program);
    assert_eq!(value_of(exit), true);
}

#[test]
fn interrupt_exit_names_the_interruptor() {
    let program = Effect::<i32, String>::never()
        .fork()
        .flat_map(|handle| handle.interrupt().map(move |exit| (handle.id(), exit)));

    let (child_id, exit) = value_of(run(program));
    match exit {
        Exit::Failure(cause) => {
            assert!(cause.interrupted());
            let interruptors = cause.interruptors();
            assert!(!interruptors.is_empty());
            assert!(!interruptors.contains(&child_id));
        }
        Exit::Success(_) => panic!("expected interruption"),
    }
}

#[test]
fn race_prefers_the_faster_side() {
    let started = Instant::now();
    let slow = Effect::<(), Infallible>::sleep(Duration::from_secs(300)).as_value("slow");
    let fast =
        Effect::<(), Infallible>::sleep(Duration::from_millis(30)).as_value("fast");

    let exit = run(slow.race(fast));
    assert_eq!(exit, Exit::Success("fast"));
    assert!(started.elapsed() < Duration::from_secs(60));
}

#[test]
fn race_against_a_pure_value_interrupts_the_loser_promptly() {
    let exit = run(Effect::<i32, String>::never().race(Effect::succeed(5)));
    assert_eq!(exit, Exit::Success(5));
}

#[test]
fn timeout_returns_none_past_the_deadline() {
    let slow = Effect::<(), String>::sleep(Duration::from_secs(300)).as_value(1);
    let exit = run(slow.timeout(Duration::from_millis(40)));
    assert_eq!(exit, Exit::Success(None));

    let quick = Effect::<i32, String>::succeed(2);
    let exit = run(quick.timeout(Duration::from_secs(30)));
    assert_eq!(exit, Exit::Success(Some(2)));
}

#[test]
fn bracket_releases_on_success_failure_and_interruption() {
    // Success path.
    let releases = Arc::new(AtomicI32::new(0));
    let r = releases.clone();
    let exit = run(Effect::<i32, String>::bracket(
        Effect::succeed(1),
        move |_| {
            let r = r.clone();
            Effect::total(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
        },
        |n| Effect::succeed(n + 1),
    ));
    assert_eq!(exit, Exit::Success(2));
    assert_eq!(releases.load(Ordering::SeqCst), 1);

    // Failure path.
    let releases = Arc::new(AtomicI32::new(0));
    let r = releases.clone();
    let exit = run(Effect::<i32, String>::bracket(
        Effect::succeed(1),
        move |_| {
            let r = r.clone();
            Effect::total(move || {
                r.fetch_add(1, Ordering::SeqCst);
            })
        },
        |_| Effect::<i32, String>::fail("use failed".into()),
    ));
    assert!(exit.is_failure());
    assert_eq!(releases.load(Ordering::SeqCst), 1);
}

#[test]
fn bracket_release_runs_when_the_use_region_is_interrupted() {
    let program = Ref::make(0i32).flat_map(|state| {
        let acquire_state = state.clone();
        let release_state = state.clone();
        let bracketed = Effect::<i32, Infallible>::bracket(
            acquire_state.set(1).as_value(1i32),
            move |_| release_state.set(2),
            |_| Effect::sleep(Duration::from_secs(3600)),
        );
        bracketed.fork().flat_map(move |handle| {
            Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                .zip_right(handle.interrupt())
                .flat_map(move |exit| {
                    assert!(exit.is_interrupted());
                    state.get()
                })
        })
    });

    assert_eq!(value_of(run(program)), 2);
}

#[test]
fn ensuring_runs_on_interruption() {
    let program = Ref::make(false).flat_map(|finalized| {
        let in_child = finalized.clone();
        Effect::<(), Infallible>::sleep(Duration::from_secs(3600))
            .ensuring(in_child.set(true))
            .fork()
            .flat_map(move |handle| {
                Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                    .zip_right(handle.interrupt())
                    .flat_map(move |_| finalized.get())
            })
    });

    assert_eq!(value_of(run(program)), true);
}

#[test]
fn uninterruptible_region_completes_before_interruption_lands() {
    let program = Ref::make(0i32).flat_map(|counter| {
        let in_child = counter.clone();
        let body = in_child
            .update(|n| n + 1)
            .uninterruptible()
            .zip_right(Effect::<(), Infallible>::never());
        body.fork().flat_map(move |handle| {
            Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                .zip_right(handle.interrupt())
                .flat_map(move |exit| {
                    assert!(exit.is_interrupted());
                    counter.get()
                })
        })
    });

    assert_eq!(value_of(run(program)), 1);
}

#[test]
fn zip_par_runs_both_sides_concurrently() {
    let started = Instant::now();
    let program = Effect::<(), String>::sleep(Duration::from_millis(300))
        .as_value(1i32)
        .zip_par(Effect::<(), String>::sleep(Duration::from_millis(300)).as_value(2i32));

    let exit = run(program);
    assert_eq!(exit, Exit::Success((1, 2)));
    // Sequential execution would need 600ms.
    assert!(started.elapsed() < Duration::from_millis(560));
}

#[test]
fn zip_par_fails_fast_and_interrupts_the_other_side() {
    let survived = Arc::new(AtomicI32::new(0));
    let s = survived.clone();
    let slow = Effect::<(), String>::sleep(Duration::from_secs(3600)).zip_right(
        Effect::<i32, String>::total(move || {
            s.fetch_add(1, Ordering::SeqCst);
            0
        }),
    );
    let failing =
        Effect::<(), String>::sleep(Duration::from_millis(30)).zip_right(Effect::<(), String>::fail("bad".into()));

    let exit = run(slow.zip_par(failing));
    match exit {
        Exit::Failure(cause) => assert!(cause.failed()),
        Exit::Success(_) => panic!("expected the failure to win"),
    }
    assert_eq!(survived.load(Ordering::SeqCst), 0);
}

#[test]
fn promise_completes_exactly_once_and_every_awaiter_agrees() {
    let program = Promise::<i32, String>::make().flat_map(|promise| {
        let p1 = promise.clone();
        let p2 = promise.clone();
        let reader1 = promise.clone();
        let reader2 = promise.clone();

        p1.succeed(1)
            .fork()
            .zip(p2.succeed(2).fork())
            .flat_map(move |(first, second)| {
                first.join().zip(second.join()).flat_map(move |(a, b)| {
                    // Exactly one of the two completions wins.
                    assert!(a ^ b);
                    reader1.await_().zip(reader2.await_())
                })
            })
    });

    let (x, y) = value_of(run(program));
    assert_eq!(x, y);
    assert!(x == 1 || x == 2);
}

#[test]
fn promise_await_after_completion_resumes_immediately() {
    let program = Promise::<&str, Infallible>::make().flat_map(|promise| {
        let reader = promise.clone();
        promise
            .succeed("ready")
            .flat_map(move |_| reader.await_())
    });
    assert_eq!(value_of(run(program)), "ready");
}

#[test]
fn fiber_ref_is_inherited_by_forked_children() {
    let program = FiberRef::make_parent_wins(0i32).flat_map(|fref| {
        let child_view = fref.clone();
        fref.locally(
            10,
            child_view
                .get::<Infallible>()
                .fork()
                .flat_map(|handle| handle.join()),
        )
    });

    assert_eq!(value_of(run(program)), 10);
}

#[test]
fn fiber_ref_merges_child_values_on_join() {
    let program = FiberRef::make::<Infallible>(0i32, |parent, child| parent.max(child)).flat_map(|fref| {
        let in_child = fref.clone();
        let readback = fref.clone();
        fref.set(5)
            .zip_right(in_child.set(8).fork().flat_map(|handle| handle.join()))
            .zip_right(readback.get())
    });

    assert_eq!(value_of(run(program)), 8);
}

#[test]
fn daemon_fibers_outlive_their_parent() {
    let program = Promise::<i32, Infallible>::make().flat_map(|promise| {
        let completer = promise.clone();
        let parent = Effect::<(), Infallible>::sleep(Duration::from_millis(50))
            .zip_right(completer.succeed(77))
            .as_value(())
            .fork_daemon()
            .as_value(());
        // Parent finishes immediately; the daemon completes later.
        parent
            .fork()
            .flat_map(|handle| handle.join())
            .zip_right(promise.await_())
    });

    assert_eq!(value_of(run(program)), 77);
}

#[test]
fn interrupting_a_parent_reaches_supervised_descendants() {
    let program = Ref::make(true).flat_map(|flag| {
        let flag_in_grandchild = flag.clone();
        let child = Effect::<(), Infallible>::sleep(Duration::from_secs(3600))
            .zip_right(flag_in_grandchild.set(false))
            .fork()
            .flat_map(|grandchild| grandchild.join())
            .as_value(());
        child.fork().flat_map(move |parent_handle| {
            Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                .zip_right(parent_handle.interrupt())
                .flat_map(move |exit| {
                    assert!(exit.is_interrupted());
                    Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                        .zip_right(flag.get())
                })
        })
    });

    assert_eq!(value_of(run(program)), true);
}

#[test]
fn on_interrupt_runs_only_for_interruption() {
    let program = Ref::make(0i32).flat_map(|hits| {
        let on_success = hits.clone();
        let check = hits.clone();
        Effect::<i32, Infallible>::succeed(3)
            .on_interrupt(on_success.update(|n| n + 1))
            .flat_map(move |_| check.get())
    });
    assert_eq!(value_of(run(program)), 0);

    let program = Ref::make(0i32).flat_map(|hits| {
        let cleanup = hits.clone();
        Effect::<(), Infallible>::sleep(Duration::from_secs(3600))
            .on_interrupt(cleanup.update(|n| n + 1))
            .fork()
            .flat_map(move |handle| {
                Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                    .zip_right(handle.interrupt())
                    .zip_right(hits.get())
            })
    });
    assert_eq!(value_of(run(program)), 1);
}

#[test]
fn yield_heavy_loops_share_the_executor() {
    // Two fibers that each yield repeatedly both make progress and
    // complete under the op-count scheduler.
    fn counting_loop(counter: Arc<AtomicI32>, remaining: i32) -> Effect<(), Infallible> {
        if remaining == 0 {
            Effect::unit()
        } else {
            Effect::<(), Infallible>::yield_now().flat_map(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                counting_loop(counter, remaining - 1)
            })
        }
    }

    let a = Arc::new(AtomicI32::new(0));
    let b = Arc::new(AtomicI32::new(0));
    let program = counting_loop(a.clone(), 500)
        .fork()
        .zip(counting_loop(b.clone(), 500).fork())
        .flat_map(|(ha, hb)| ha.join().zip_right(hb.join()));

    value_of(run(program));
    assert_eq!(a.load(Ordering::SeqCst), 500);
    assert_eq!(b.load(Ordering::SeqCst), 500);
}

#[test]
fn blocking_effects_run_on_the_blocking_pool() {
    let program = Effect::<String, Infallible>::total(|| {
        std::thread::current().name().unwrap_or("").to_string()
    })
    .on_blocking_executor();

    let name = value_of(run(program));
    assert!(name.contains("blocking"), "ran on {name:?}");
}

#[test]
fn descriptor_reports_identity_and_interrupt_status() {
    let program = Effect::<fibra::FiberDescriptor, Infallible>::descriptor();
    let descriptor = value_of(run(program));
    assert!(descriptor.id.as_u64() > 0);
    assert!(descriptor.interruptible);
    assert!(descriptor.interruptors.is_empty());

    let masked = Effect::<fibra::FiberDescriptor, Infallible>::descriptor().uninterruptible();
    let descriptor = value_of(run(masked));
    assert!(!descriptor.interruptible);
}

#[test]
fn catch_all_cannot_swallow_interruption() {
    let program = Effect::<i32, String>::never()
        .catch_all(|_| Effect::<i32, String>::succeed(0))
        .fork()
        .flat_map(|handle| {
            Effect::<(), String>::sleep(Duration::from_millis(50)).zip_right(handle.interrupt())
        });

    let exit = value_of(run(program));
    assert!(exit.is_interrupted());
}

#[test]
fn provided_environment_is_scoped() {
    #[derive(Debug, Clone, PartialEq)]
    struct Tag(&'static str);

    let inner = Effect::<Tag, Infallible>::service();
    let program = inner
        .provide(fibra::Environment::empty().add(Tag("inner")))
        .zip(
            Effect::<Tag, Infallible>::service()
                .provide(fibra::Environment::empty().add(Tag("outer"))),
        );

    let (a, b) = value_of(run(program));
    assert_eq!(a, Tag("inner"));
    assert_eq!(b, Tag("outer"));
}

#[test]
fn interruption_composes_into_the_cause_of_a_failing_finalizer_chain() {
    // A failing effect whose fiber is also interrupted surfaces both.
    let program = Effect::<(), String>::sleep(Duration::from_millis(30))
        .zip_right(Effect::<(), String>::fail("late failure".into()))
        .uninterruptible()
        .fork()
        .flat_map(|handle| handle.interrupt_as(fibra::FiberId::new(4242)));

    let exit = value_of(run(program));
    match exit {
        Exit::Failure(cause) => {
            assert!(cause.failed());
            assert!(cause.interrupted());
            assert!(cause.interruptors().contains(&fibra::FiberId::new(4242)));
        }
        Exit::Success(_) => panic!("expected a combined failure"),
    }
}

#[test]
fn sleep_durations_accumulate_on_the_timer() {
    let started = Instant::now();
    let program: Effect<(), Infallible> = Effect::sleep(Duration::from_millis(40))
        .zip_right(Effect::sleep(Duration::from_millis(40)));
    value_of(run(program));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(75), "elapsed {elapsed:?}");
}

#[test]
fn distinct_interruptors_all_reach_the_final_cause() {
    // The fiber fails with an inline interruption cause while a
    // different, externally-requested interruption is still pending in
    // its accumulator. The terminal merge must compare interruptor
    // identity, not mere presence, so both ids survive into the exit.
    let inline_id = fibra::FiberId::new(5001);
    let external_id = fibra::FiberId::new(5002);

    let program = Effect::<(), String>::sleep(Duration::from_millis(100))
        .zip_right(Effect::<i32, String>::halt(Cause::interrupt(inline_id)))
        .uninterruptible()
        .fork()
        .flat_map(move |handle| {
            // Lands while the fiber is masked: accumulated, not yet
            // delivered, and absent from the inline cause.
            Effect::<(), String>::sleep(Duration::from_millis(40))
                .zip_right(handle.interrupt_as(external_id))
        });

    let exit = value_of(run(program));
    match exit {
        Exit::Failure(cause) => {
            let interruptors = cause.interruptors();
            assert!(interruptors.contains(&inline_id));
            assert!(interruptors.contains(&external_id));
        }
        Exit::Success(_) => panic!("expected an interrupted failure"),
    }
}

#[test]
fn self_interruption_is_observable_through_the_cause_channel() {
    // An inline interrupt cause (as opposed to interruption requested
    // by another fiber) is an ordinary cause and is visible to
    // catch_all_cause.
    let exit = run(Effect::<bool, String>::interrupt()
        .catch_all_cause(|cause: Cause<String>| {
            Effect::<bool, String>::succeed(cause.interrupted())
        }));

    assert_eq!(exit, Exit::Success(true));
}
