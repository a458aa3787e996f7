use proptest::prelude::*;
use slate_core::{resolve_roles, Profile, Role, UserId};

fn role() -> impl Strategy<Value = Role> {
    prop_oneof![Just(Role::Dominant), Just(Role::Submissive)]
}

proptest! {
    #[test]
    fn prop_linked_partners_never_share_a_role(
        a in "[a-z0-9]{1,12}",
        b in "[a-z0-9]{1,12}",
        role_a in role(),
        role_b in role(),
    ) {
        prop_assume!(a != b);
        let me = Profile::new(UserId::new(a), role_a);
        let partner = Profile::new(UserId::new(b), role_b);

        let (mine, theirs) = resolve_roles(&me, Some(&partner));
        prop_assert_ne!(Some(mine), theirs);
    }

    #[test]
    fn prop_resolution_is_symmetric(
        a in "[a-z0-9]{1,12}",
        b in "[a-z0-9]{1,12}",
        role_a in role(),
        role_b in role(),
    ) {
        prop_assume!(a != b);
        let pa = Profile::new(UserId::new(a), role_a);
        let pb = Profile::new(UserId::new(b), role_b);

        let (a_sees_a, a_sees_b) = resolve_roles(&pa, Some(&pb));
        let (b_sees_b, b_sees_a) = resolve_roles(&pb, Some(&pa));
        prop_assert_eq!(a_sees_a, b_sees_a.unwrap());
        prop_assert_eq!(a_sees_b.unwrap(), b_sees_b);
    }
}
