//! Queue semantics under the runtime: admission strategies,
//! back-pressure, FIFO delivery, and shutdown.

use std::convert::Infallible;
use std::time::Duration;

use fibra::{Effect, Exit, Queue, Runtime};

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
fn offer_then_take_round_trips() {
    let program = Queue::<i32>::unbounded::<Infallible>().flat_map(|queue| {
        let taker = queue.clone();
        queue.offer(7).flat_map(move |admitted| {
            assert!(admitted);
            taker.take()
        })
    });
    assert_eq!(value_of(run(program)), 7);
}

#[test]
fn fifo_order_is_preserved() {
    let program = Queue::<i32>::unbounded::<Infallible>().flat_map(|queue| {
        let drain = queue.clone();
        queue
            .offer_all((0..100).collect())
            .flat_map(move |rejected| {
                assert!(rejected.is_empty());
                drain.take_all()
            })
    });
    assert_eq!(value_of(run(program)), (0..100).collect::<Vec<_>>());
}

#[test]
fn bounded_queue_backpressures_the_third_producer() {
    // Capacity 2: one producer offers A, B, C in order. C suspends
    // until the consumer takes; everything arrives in order and the
    // buffer never exceeds capacity.
    let program = Queue::<&str>::bounded::<Infallible>(2).flat_map(|queue| {
        let observer = queue.clone();
        let consumer = queue.clone();
        queue
            .offer_all(vec!["A", "B", "C"])
            .fork()
            .flat_map(move |producer| {
                Effect::<(), Infallible>::sleep(Duration::from_millis(50))
                    .zip_right(observer.size())
                    .flat_map(move |size| {
                        // A and B buffered; C is parked.
                        assert_eq!(size, 2);
                        consumer.take().flat_map(move |first| {
                            assert_eq!(first, "A");
                            producer.join().zip_right(
                                consumer
                                    .take()
                                    .zip(consumer.take())
                                    .map(|(b, c)| vec!["A", b, c]),
                            )
                        })
                    })
            })
    });

    assert_eq!(value_of(run(program)), vec!["A", "B", "C"]);
}

#[test]
fn bounded_size_never_exceeds_capacity() {
    let program = Queue::<i32>::bounded::<Infallible>(3).flat_map(|queue| {
        let check = queue.clone();
        let drain = queue.clone();
        queue
            .offer_all((0..10).collect())
            .fork()
            .flat_map(move |producer| {
                fn drain_all(
                    queue: Queue<i32>,
                    check: Queue<i32>,
                    mut seen: Vec<i32>,
                    remaining: usize,
                ) -> Effect<Vec<i32>, Infallible> {
                    if remaining == 0 {
                        Effect::succeed(seen)
                    } else {
                        check.size().flat_map(move |size| {
                            assert!(size <= 3, "buffer grew to {size}");
                            queue.clone().take().flat_map(move |item| {
                                seen.push(item);
                                drain_all(queue, check, seen, remaining - 1)
                            })
                        })
                    }
                }
                drain_all(drain, check, Vec::new(), 10).zip_left(producer.join())
            })
    });

    assert_eq!(value_of(run(program)), (0..10).collect::<Vec<_>>());
}

#[test]
fn dropping_queue_reports_rejected_items() {
    let program = Queue::<i32>::dropping::<Infallible>(2).flat_map(|queue| {
        let drain = queue.clone();
        queue
            .offer_all(vec![1, 2, 3, 4])
            .flat_map(move |rejected| drain.take_all().map(move |kept| (kept, rejected)))
    });

    let (kept, rejected) = value_of(run(program));
    assert_eq!(kept, vec![1, 2]);
    assert_eq!(rejected, vec![3, 4]);
}

#[test]
fn sliding_queue_keeps_the_newest_items() {
    let program = Queue::<i32>::sliding::<Infallible>(2).flat_map(|queue| {
        let drain = queue.clone();
        queue.offer_all(vec![1, 2, 3]).flat_map(move |rejected| {
            assert!(rejected.is_empty());
            drain.take_all()
        })
    });

    assert_eq!(value_of(run(program)), vec![2, 3]);
}

#[test]
fn poll_is_non_blocking() {
    let program = Queue::<i32>::unbounded::<Infallible>().flat_map(|queue| {
        let filled = queue.clone();
        queue.poll().flat_map(move |empty| {
            assert_eq!(empty, None);
            let reader = filled.clone();
            filled.offer(5).zip_right(reader.poll())
        })
    });

    assert_eq!(value_of(run(program)), Some(5));
}

#[test]
fn take_up_to_returns_at_most_n() {
    let program = Queue::<i32>::unbounded::<Infallible>().flat_map(|queue| {
        let drain = queue.clone();
        queue
            .offer_all(vec![1, 2, 3, 4, 5])
            .zip_right(drain.take_up_to(3))
    });

    assert_eq!(value_of(run(program)), vec![1, 2, 3]);
}

#[test]
fn take_suspends_until_an_offer_arrives() {
    let program = Queue::<i32>::unbounded::<Infallible>().flat_map(|queue| {
        let producer = queue.clone();
        queue.take().fork().flat_map(move |taker| {
            Effect::<(), Infallible>::sleep(Duration::from_millis(40))
                .zip_right(producer.offer(11))
                .zip_right(taker.join())
        })
    });

    assert_eq!(value_of(run(program)), 11);
}

#[test]
fn shutdown_interrupts_pending_and_future_operations() {
    let program = Queue::<i32>::bounded::<Infallible>(1).flat_map(|queue| {
        let to_shut = queue.clone();
        let late = queue.clone();
        // Park a taker, then shut down.
        queue.take().fork().flat_map(move |taker| {
            Effect::<(), Infallible>::sleep(Duration::from_millis(40))
                .zip_right(to_shut.shutdown())
                .zip_right(taker.await_exit())
                .flat_map(move |taker_exit| {
                    assert!(taker_exit.is_interrupted());
                    // Future operations are interrupted too.
                    late.offer(1).to_exit().zip(late.is_shutdown())
                })
        })
    });

    let (offer_exit, is_shutdown) = value_of(run(program));
    assert!(offer_exit.is_interrupted());
    assert!(is_shutdown);
}

#[test]
fn shutdown_is_idempotent() {
    let program = Queue::<i32>::unbounded::<Infallible>().flat_map(|queue| {
        let again = queue.clone();
        let check = queue.clone();
        queue
            .shutdown()
            .zip_right(again.shutdown())
            .zip_right(check.is_shutdown())
    });

    assert!(value_of(run(program)));
}

#[test]
fn concurrent_producers_and_consumers_deliver_every_item_once() {
    const PRODUCERS: i32 = 4;
    const PER_PRODUCER: i32 = 25;

    let program = Queue::<i32>::bounded::<Infallible>(8).flat_map(|queue| {
        let mut producers = Effect::<(), Infallible>::unit();
        for p in 0..PRODUCERS {
            let q = queue.clone();
            let items: Vec<i32> = (0..PER_PRODUCER).map(|i| p * PER_PRODUCER + i).collect();
            producers = producers
                .flat_map(move |_| q.offer_all(items).as_value(()).fork().map(|_| ()));
        }

        fn consume(queue: Queue<i32>, mut acc: Vec<i32>, n: usize) -> Effect<Vec<i32>, Infallible> {
            if n == 0 {
                Effect::succeed(acc)
            } else {
                queue.clone().take().flat_map(move |item| {
                    acc.push(item);
                    consume(queue, acc, n - 1)
                })
            }
        }

        let consumer_a = consume(queue.clone(), Vec::new(), 50).fork();
        let consumer_b = consume(queue.clone(), Vec::new(), 50).fork();

        producers.zip_right(consumer_a.zip(consumer_b).flat_map(|(a, b)| {
            a.join().zip(b.join()).map(|(mut xs, ys)| {
                xs.extend(ys);
                xs.sort_unstable();
                xs
            })
        }))
    });

    let delivered = value_of(run(program));
    assert_eq!(
        delivered,
        (0..PRODUCERS * PER_PRODUCER).collect::<Vec<_>>()
    );
}
