mod common;

use common::{BACKENDS, ScriptedEngine, init_tracing, ok};
use httpool::reactor::{Interest, SocketAction};
use httpool::service::EventLoop;
use httpool::{BackendKind, Disposal, Pool, PoolBuilder, RegistrationOp, RunError};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

fn pool(backend: BackendKind) -> Pool<ScriptedEngine> {
    init_tracing();
    Pool::new(ScriptedEngine::new(), backend, 0).expect("Pool should build")
}

#[test]
fn test_engine_keeps_the_backend_token() {
    for backend in BACKENDS {
        let mut pool = pool(backend);

        let id = pool
            .send_get("http://localhost/token", (), |_| Disposal::Free)
            .expect("submit should succeed");
        let fd = pool.engine().fd(id).expect("transfer should own a socket");

        let registration = pool
            .reactor()
            .registration(fd)
            .expect("socket should be registered");

        assert_eq!(registration.interest, Interest::READ, "{backend}");
        assert_eq!(pool.engine().token(fd), Some(registration.token), "{backend}");
    }
}

#[test]
fn test_interest_change_keeps_one_registration() {
    for backend in BACKENDS {
        let mut pool = pool(backend);

        let id = pool
            .send_get("http://localhost/upload", (), |_| Disposal::Free)
            .expect("submit should succeed");
        let fd = pool.engine().fd(id).expect("transfer should own a socket");

        pool.engine_mut().request_interest(fd, SocketAction::InOut);
        pool.run_once(Duration::from_millis(10))
            .expect("run_once should succeed");

        let registration = pool
            .reactor()
            .registration(fd)
            .expect("socket should stay registered");

        assert_eq!(registration.interest, Interest::BOTH, "{backend}");
        assert_eq!(pool.reactor().registrations(), 1, "{backend}");
        assert_eq!(pool.engine().token(fd), Some(registration.token), "{backend}");
    }
}

#[test]
fn test_registrations_are_released_after_completion() {
    for backend in BACKENDS {
        let mut pool = pool(backend);

        let id = pool
            .send_get("http://localhost/done", (), |_| Disposal::Free)
            .expect("submit should succeed");
        let fd = pool.engine().fd(id).expect("transfer should own a socket");

        pool.engine_mut().finish(id, ok(200, "done"));
        pool.run_until_idle(Duration::from_millis(100))
            .expect("run should succeed");

        assert!(pool.reactor().registration(fd).is_none(), "{backend}");
        assert_eq!(pool.reactor().registrations(), 0, "{backend}");
    }
}

#[test]
fn test_failed_modify_leaves_registration_untouched() {
    // The service loop watches descriptors with poll(2) and has no kernel
    // state to refuse a modification.
    for backend in [BackendKind::RawReactor, BackendKind::LoopLibrary] {
        let mut pool = pool(backend);

        let id = pool
            .send_get("http://localhost/closed", (), |_| Disposal::Free)
            .expect("submit should succeed");
        let fd = pool.engine().fd(id).expect("transfer should own a socket");
        let before = pool.reactor().registration(fd);

        pool.engine_mut().close_socket(id);
        pool.engine_mut().request_interest(fd, SocketAction::Out);

        let err = pool
            .run_once(Duration::from_millis(10))
            .expect_err("modifying a closed socket should fail");

        match err {
            RunError::Registration(e) => {
                assert_eq!(e.fd, fd);
                assert_eq!(e.op, RegistrationOp::Modify);
            }
            other => panic!("unexpected error: {other}"),
        }

        assert_eq!(pool.reactor().registration(fd), before, "{backend}");
    }
}

#[test]
fn test_shared_service_loop_runs_caller_sources() {
    init_tracing();

    let shared = Rc::new(RefCell::new(EventLoop::new()));
    let ticks = Rc::new(Cell::new(0));

    let counter = Rc::clone(&ticks);
    let own = shared.borrow_mut().add_time(Instant::now(), move |_| {
        counter.set(counter.get() + 1);
    });

    let mut pool: Pool<ScriptedEngine> = PoolBuilder::new()
        .service_loop(Rc::clone(&shared))
        .build(ScriptedEngine::new())
        .expect("Pool should build");

    assert_eq!(pool.backend(), BackendKind::ServiceLoop);

    let id = pool
        .send_get("http://localhost/shared", (), |_| Disposal::Free)
        .expect("submit should succeed");
    assert_eq!(shared.borrow().len(), 2);

    pool.engine_mut().finish(id, ok(200, "shared"));
    pool.run_until_idle(Duration::from_millis(100))
        .expect("run should succeed");

    assert_eq!(ticks.get(), 1);

    drop(pool);

    let event_loop = shared.borrow();
    assert!(event_loop.contains(own));
    assert_eq!(event_loop.len(), 1);
}
