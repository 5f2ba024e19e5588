use super::*;
use crate::{FutexError, KeyScope};

#[test]
fn test_resolve_is_deterministic() {
    let fx = Fixture::new();
    for scope in [KeyScope::Private, KeyScope::Shared] {
        let a = FutexKey::resolve(&*fx.space, BASE + 8, scope).unwrap();
        let b = FutexKey::resolve(&*fx.space, BASE + 8, scope).unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn test_private_keys_differ_across_spaces() {
    let fx = Fixture::new();
    let other = MockUserSpace::new(2, fx.phys.clone());
    other.map_private(BASE, MAP_LEN);

    let a = FutexKey::resolve(&*fx.space, BASE, KeyScope::Private).unwrap();
    let b = FutexKey::resolve(&*other, BASE, KeyScope::Private).unwrap();
    assert_ne!(a, b);

    // 私有映射即使不带 PRIVATE 标志也得到私有 key
    let a = FutexKey::resolve(&*fx.space, BASE, KeyScope::Shared).unwrap();
    let b = FutexKey::resolve(&*other, BASE, KeyScope::Shared).unwrap();
    assert!(!a.is_shared());
    assert_ne!(a, b);
}

#[test]
fn test_shared_mapping_gives_equal_keys_across_spaces() {
    let fx = Fixture::new();
    let object = fx.phys.alloc_object();
    fx.space.map_shared(0x10_0000, 0x2000, object, 0x1000);

    let other = MockUserSpace::new(2, fx.phys.clone());
    other.map_shared(0x50_0000, 0x3000, object, 0);

    // 两边都指向对象内偏移 0x1010
    let a = FutexKey::resolve(&*fx.space, 0x10_0010, KeyScope::Shared).unwrap();
    let b = FutexKey::resolve(&*other, 0x50_1010, KeyScope::Shared).unwrap();
    assert!(a.is_shared());
    assert_eq!(a, b);
    assert_eq!(
        a,
        FutexKey::Shared {
            object,
            offset: 0x1010
        }
    );

    // PRIVATE 标志下不查询映射
    let a = FutexKey::resolve(&*fx.space, 0x10_0010, KeyScope::Private).unwrap();
    let b = FutexKey::resolve(&*other, 0x50_1010, KeyScope::Private).unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_misaligned_address_is_invalid() {
    let fx = Fixture::new();
    for scope in [KeyScope::Private, KeyScope::Shared] {
        assert_eq!(
            FutexKey::resolve(&*fx.space, BASE + 2, scope),
            Err(FutexError::InvalidArgument)
        );
    }
}

#[test]
fn test_unmapped_address_faults_only_when_lookup_needed() {
    let fx = Fixture::new();
    let unmapped = 0xdead_0000;
    assert_eq!(
        FutexKey::resolve(&*fx.space, unmapped, KeyScope::Shared),
        Err(FutexError::Fault)
    );
    assert_eq!(
        FutexKey::resolve(&*fx.space, unmapped, KeyScope::Private),
        Ok(fx.key(unmapped))
    );
}

#[test]
fn test_keys_are_totally_ordered() {
    let private = FutexKey::Private { space: 9, uaddr: 0 };
    let shared = FutexKey::Shared { object: 0, offset: 0 };
    assert!(private < shared);
    assert!(FutexKey::Private { space: 1, uaddr: 8 } < FutexKey::Private { space: 2, uaddr: 0 });
}
