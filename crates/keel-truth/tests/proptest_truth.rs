//! Property tests for the store.
//!
//! Random operation sequences are applied to a prototype/instance pair and
//! the merged set view is checked against a straightforward model.

use std::collections::HashSet;

use keel_truth::prelude::*;
use proptest::prelude::*;

/// Operations applied to a (prototype, instance) pair sharing one
/// reference-set property.
#[derive(Debug, Clone)]
enum SetOp {
    AddToPrototype(u8),
    AddToInstance(u8),
    RemoveInherited(u8),
    CancelRemove(u8),
    RemoveLocal(u8),
}

fn set_op_strategy() -> impl Strategy<Value = SetOp> {
    prop_oneof![
        any::<u8>().prop_map(SetOp::AddToPrototype),
        any::<u8>().prop_map(SetOp::AddToInstance),
        any::<u8>().prop_map(SetOp::RemoveInherited),
        any::<u8>().prop_map(SetOp::CancelRemove),
        any::<u8>().prop_map(SetOp::RemoveLocal),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn effective_set_matches_model(ops in prop::collection::vec(set_op_strategy(), 1..40)) {
        let mut truth = Truth::new();
        let elem_ty = truth
            .create_type("element", vec![PropertyDef::new("tag", PropertyKind::U32)])
            .unwrap();
        let holder_ty = truth
            .create_type(
                "holder",
                vec![PropertyDef::new("refs", PropertyKind::ReferenceSet)],
            )
            .unwrap();

        let proto = truth.create_object_of_type(holder_ty, NO_UNDO_SCOPE);
        let inst = truth.create_object_from_prototype(proto, NO_UNDO_SCOPE).unwrap();

        // Pool of referenceable elements, indexed by the op's u8 % 16.
        let pool: Vec<ObjectId> = (0..16)
            .map(|_| truth.create_object_of_type(elem_ty, NO_UNDO_SCOPE))
            .collect();

        // Model state.
        let mut proto_added: Vec<ObjectId> = Vec::new();
        let mut inst_added: Vec<ObjectId> = Vec::new();
        let mut inst_removed: Vec<ObjectId> = Vec::new();

        for op in &ops {
            match op {
                SetOp::AddToPrototype(i) => {
                    let e = pool[(*i % 16) as usize];
                    let mut w = truth.write(proto).unwrap();
                    truth.add_to_reference_set(&mut w, 0, &[e]);
                    truth.commit(w, NO_UNDO_SCOPE);
                    if !proto_added.contains(&e) {
                        proto_added.push(e);
                    }
                }
                SetOp::AddToInstance(i) => {
                    let e = pool[(*i % 16) as usize];
                    let mut w = truth.write(inst).unwrap();
                    truth.add_to_reference_set(&mut w, 0, &[e]);
                    truth.commit(w, NO_UNDO_SCOPE);
                    if !inst_added.contains(&e) {
                        inst_added.push(e);
                    }
                    inst_removed.retain(|&r| r != e);
                }
                SetOp::RemoveInherited(i) => {
                    let e = pool[(*i % 16) as usize];
                    truth
                        .remove_from_prototype_reference_set(inst, 0, e, NO_UNDO_SCOPE)
                        .unwrap();
                    if !inst_removed.contains(&e) {
                        inst_removed.push(e);
                    }
                }
                SetOp::CancelRemove(i) => {
                    let e = pool[(*i % 16) as usize];
                    truth
                        .cancel_remove_from_prototype_reference_set(inst, 0, e, NO_UNDO_SCOPE)
                        .unwrap();
                    inst_removed.retain(|&r| r != e);
                }
                SetOp::RemoveLocal(i) => {
                    let e = pool[(*i % 16) as usize];
                    let mut w = truth.write(inst).unwrap();
                    truth.remove_from_reference_set(&mut w, 0, &[e]);
                    truth.commit(w, NO_UNDO_SCOPE);
                    if let Some(pos) = inst_added.iter().position(|&a| a == e) {
                        inst_added.remove(pos);
                    } else if !inst_removed.contains(&e) {
                        inst_removed.push(e);
                    }
                }
            }

            // Model: (prototype effective \ removed) ++ added, deduplicated.
            let mut expected: Vec<ObjectId> = proto_added
                .iter()
                .filter(|e| !inst_removed.contains(e))
                .copied()
                .collect();
            for &a in &inst_added {
                if !expected.contains(&a) {
                    expected.push(a);
                }
            }

            let actual = truth.get_reference_set(inst, 0);
            prop_assert_eq!(&actual, &expected);

            // No duplicates, ever.
            let unique: HashSet<_> = actual.iter().collect();
            prop_assert_eq!(unique.len(), actual.len());

            // The prototype's own view is unaffected by instance edits.
            let proto_view = truth.get_reference_set(proto, 0);
            prop_assert_eq!(&proto_view, &proto_added);
        }
    }

    #[test]
    fn scalar_commits_round_trip_through_undo(values in prop::collection::vec(any::<u32>(), 1..20)) {
        let mut truth = Truth::new();
        let ty = truth
            .create_type("num", vec![PropertyDef::new("v", PropertyKind::U32)])
            .unwrap();
        let id = truth.create_object_of_type(ty, NO_UNDO_SCOPE);

        let scope = truth.create_undo_scope("edits");
        for &v in &values {
            let mut w = truth.write(id).unwrap();
            truth.set_u32(&mut w, 0, v);
            truth.commit(w, scope);
        }
        let final_value = *values.last().unwrap();
        prop_assert_eq!(truth.get_u32(id, 0), final_value);

        truth.undo(scope);
        prop_assert_eq!(truth.get_u32(id, 0), 0);

        truth.redo(scope);
        prop_assert_eq!(truth.get_u32(id, 0), final_value);
    }
}
