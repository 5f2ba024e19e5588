use uapi::futex::futex_op;

use super::*;
use crate::{AtomicOp, FutexError};

fn wake_op_args(uaddr: usize, uaddr2: usize, nr_wake: u32, nr_wake2: u32, encoded: u32) -> FutexArgs {
    FutexArgs {
        uaddr,
        op: FUTEX_WAKE_OP | FUTEX_PRIVATE_FLAG,
        val: nr_wake,
        val2: nr_wake2,
        uaddr2,
        val3: encoded,
        ..Default::default()
    }
}

#[test]
fn test_apply_vector_table() {
    let fx = Fixture::new();
    let uaddr = BASE + 0x40;

    // 旧值 5，操作数 3
    let ops = [
        (FUTEX_OP_SET, 3),
        (FUTEX_OP_ADD, 8),
        (FUTEX_OP_OR, 7),
        (FUTEX_OP_ANDN, 4),
        (FUTEX_OP_XOR, 6),
    ];
    // (比较, cmparg, 与旧值 5 比较的结果)
    let cmps = [
        (FUTEX_OP_CMP_EQ, 5, true),
        (FUTEX_OP_CMP_EQ, 3, false),
        (FUTEX_OP_CMP_NE, 5, false),
        (FUTEX_OP_CMP_NE, 6, true),
        (FUTEX_OP_CMP_LT, 6, true),
        (FUTEX_OP_CMP_LT, 5, false),
        (FUTEX_OP_CMP_LE, 5, true),
        (FUTEX_OP_CMP_LE, 4, false),
        (FUTEX_OP_CMP_GT, 4, true),
        (FUTEX_OP_CMP_GT, 5, false),
        (FUTEX_OP_CMP_GE, 5, true),
        (FUTEX_OP_CMP_GE, 6, false),
    ];

    for (op, expected_word) in ops {
        for (cmp, cmparg, expected_cmp) in cmps {
            fx.space.store_u32(uaddr, 5);
            let decoded = AtomicOp::decode(futex_op(op, 3, cmp, cmparg));
            assert_eq!(
                decoded.apply(&*fx.space, uaddr),
                Ok(expected_cmp),
                "op={} cmp={} cmparg={}",
                op,
                cmp,
                cmparg
            );
            assert_eq!(fx.space.load_u32(uaddr), expected_word, "op={}", op);
        }
    }
}

#[test]
fn test_apply_compares_old_value() {
    let fx = Fixture::new();
    let uaddr = BASE;
    fx.space.store_u32(uaddr, 5);

    // 5 + 5 = 10，但比较使用旧值 5
    let op = AtomicOp::decode(futex_op(FUTEX_OP_ADD, 5, FUTEX_OP_CMP_EQ, 10));
    assert_eq!(op.apply(&*fx.space, uaddr), Ok(false));
    assert_eq!(fx.space.load_u32(uaddr), 10);
}

#[test]
fn test_apply_signed_compare_and_shift() {
    let fx = Fixture::new();
    let uaddr = BASE;

    fx.space.store_u32(uaddr, u32::MAX);
    let op = AtomicOp::decode(futex_op(FUTEX_OP_SET, 0, FUTEX_OP_CMP_LT, 0));
    assert_eq!(op.apply(&*fx.space, uaddr), Ok(true));
    assert_eq!(fx.space.load_u32(uaddr), 0);

    let op = AtomicOp::decode(futex_op(FUTEX_OP_OR | FUTEX_OP_OPARG_SHIFT, 4, FUTEX_OP_CMP_EQ, 0));
    assert_eq!(op.apply(&*fx.space, uaddr), Ok(true));
    assert_eq!(fx.space.load_u32(uaddr), 1 << 4);
}

#[test]
fn test_apply_unsupported_op_and_cmp() {
    let fx = Fixture::new();
    let uaddr = BASE;
    fx.space.store_u32(uaddr, 9);

    let bad_op = AtomicOp::decode(futex_op(6, 1, FUTEX_OP_CMP_EQ, 0));
    assert_eq!(bad_op.apply(&*fx.space, uaddr), Err(FutexError::NotSupported));
    assert_eq!(fx.space.load_u32(uaddr), 9);

    // 比较类型非法时修改已经生效
    let bad_cmp = AtomicOp::decode(futex_op(FUTEX_OP_SET, 1, 9, 0));
    assert_eq!(bad_cmp.apply(&*fx.space, uaddr), Err(FutexError::NotSupported));
    assert_eq!(fx.space.load_u32(uaddr), 1);
}

#[test]
fn test_apply_faults_with_page_faults_disabled() {
    let fx = Fixture::new();
    let uaddr = BASE + 0x1000;
    fx.space.store_u32(uaddr, 1);
    fx.space.evict(uaddr);

    let op = AtomicOp::decode(futex_op(FUTEX_OP_ADD, 1, FUTEX_OP_CMP_EQ, 1));
    assert_eq!(op.apply(&*fx.space, uaddr), Err(FutexError::Fault));
    assert_eq!(fx.space.fault_count(), 0);
    assert!(!MockUserSpace::page_faults_disabled());
    assert_eq!(fx.space.load_u32(uaddr), 1);
}

/// 在 `uaddr` 上启动 `n` 个等待者
fn spawn_waiters<'s>(
    s: &'s std::thread::Scope<'s, '_>,
    fx: &'s Fixture,
    tasks: &'s [MockTask],
    uaddr: usize,
) {
    for task in tasks {
        s.spawn(move || fx.manager.futex(task, &wait_args(uaddr, 0)));
    }
}

#[test]
fn test_wake_op_condition_selects_second_wake() {
    let fx = Fixture::new();
    let (ua, ub) = (BASE, BASE + 4);
    let (ka, kb) = (fx.key(ua), fx.key(ub));
    let on_a: std::vec::Vec<MockTask> = (1..=2).map(|tid| fx.task(tid)).collect();
    let on_b: std::vec::Vec<MockTask> = (3..=4).map(|tid| fx.task(tid)).collect();
    let waker = fx.task(10);

    std::thread::scope(|s| {
        spawn_waiters(s, &fx, &on_a, ua);
        spawn_waiters(s, &fx, &on_b, ub);
        wait_for_waiters(fx.table(), &ka, 2);
        wait_for_waiters(fx.table(), &kb, 2);

        // 等待者在 ub 上等待值 0，修改后需要还原
        // 比较不成立：只唤醒 a
        let miss = futex_op(FUTEX_OP_SET, 0, FUTEX_OP_CMP_NE, 0);
        assert_eq!(fx.manager.futex(&waker, &wake_op_args(ua, ub, 1, 1, miss)), Ok(1));
        assert_eq!(fx.table().waiter_count(&ka), Some(1));
        assert_eq!(fx.table().waiter_count(&kb), Some(2));

        // 比较成立：a 与 b 各唤醒一个
        let hit = futex_op(FUTEX_OP_ADD, 1, FUTEX_OP_CMP_EQ, 0);
        assert_eq!(fx.manager.futex(&waker, &wake_op_args(ua, ub, 1, 1, hit)), Ok(2));
        assert_eq!(fx.space.load_u32(ub), 1);
        assert_eq!(fx.table().waiter_count(&kb), Some(1));

        let hit = futex_op(FUTEX_OP_SET, 0, FUTEX_OP_CMP_EQ, 1);
        assert_eq!(fx.manager.futex(&waker, &wake_op_args(ua, ub, 0, 5, hit)), Ok(1));
    });
    assert!(fx.table().is_empty());
}

#[test]
fn test_wake_op_same_address_rejected() {
    let fx = Fixture::new();
    let task = fx.task(1);
    let op = futex_op(FUTEX_OP_SET, 1, FUTEX_OP_CMP_EQ, 0);
    assert_eq!(
        fx.manager.futex(&task, &wake_op_args(BASE, BASE, 1, 1, op)),
        Err(FutexError::InvalidArgument)
    );
    assert_eq!(fx.space.load_u32(BASE), 0);
    assert!(fx.table().is_empty());
}

#[test]
fn test_wake_op_aliased_object_wakes_first_twice() {
    let fx = Fixture::new();
    let object = fx.phys.alloc_object();
    // 同一共享对象映射两次
    let (ua, ub) = (0x20_0000, 0x30_0000);
    fx.space.map_shared(ua, 0x1000, object, 0);
    fx.space.map_shared(ub, 0x1000, object, 0);
    let key = FutexKey::Shared { object, offset: 0 };

    let tasks: std::vec::Vec<MockTask> = (1..=3).map(|tid| fx.task(tid)).collect();
    let waker = fx.task(10);
    let shared_wait = |task: &MockTask| {
        let args = FutexArgs {
            op: FUTEX_WAIT,
            ..wait_args(ua, 0)
        };
        fx.manager.futex(task, &args)
    };

    std::thread::scope(|s| {
        for task in &tasks {
            let shared_wait = &shared_wait;
            s.spawn(move || shared_wait(task));
        }
        wait_for_waiters(fx.table(), &key, 3);

        let args = FutexArgs {
            op: FUTEX_WAKE_OP,
            ..wake_op_args(ua, ub, 1, 1, futex_op(FUTEX_OP_SET, 0, FUTEX_OP_CMP_EQ, 0))
        };
        assert_eq!(fx.manager.futex(&waker, &args), Ok(2));
        assert_eq!(fx.table().waiter_count(&key), Some(1));

        let wake_rest = FutexArgs {
            op: FUTEX_WAKE,
            ..wake_args(ub, 1)
        };
        assert_eq!(fx.manager.futex(&waker, &wake_rest), Ok(1));
    });
    assert!(fx.table().is_empty());
}

#[test]
fn test_wake_op_retries_after_page_fault() {
    let fx = Fixture::new();
    let (ua, ub) = (BASE, BASE + 0x2000);
    fx.space.store_u32(ub, 1);
    fx.space.evict(ub);
    let task = fx.task(1);

    let op = futex_op(FUTEX_OP_ADD, 1, FUTEX_OP_CMP_EQ, 1);
    assert_eq!(fx.manager.futex(&task, &wake_op_args(ua, ub, 1, 1, op)), Ok(0));
    assert_eq!(fx.space.fault_count(), 1);
    assert_eq!(fx.space.load_u32(ub), 2);
    assert!(fx.table().is_empty());
}

#[test]
fn test_wake_op_unmapped_or_unsupported() {
    let fx = Fixture::new();
    let task = fx.task(1);

    let op = futex_op(FUTEX_OP_ADD, 1, FUTEX_OP_CMP_EQ, 1);
    assert_eq!(
        fx.manager.futex(&task, &wake_op_args(BASE, 0xdead_0000, 1, 1, op)),
        Err(FutexError::Fault)
    );

    let bad = futex_op(7, 1, FUTEX_OP_CMP_EQ, 1);
    assert_eq!(
        fx.manager.futex(&task, &wake_op_args(BASE, BASE + 4, 1, 1, bad)),
        Err(FutexError::NotSupported)
    );
    assert_eq!(fx.space.fault_count(), 0);
    assert!(fx.table().is_empty());
}
