//! Prototype inheritance end-to-end tests: overrides, clears, subobject
//! sets, instantiation, and clone-vs-instance semantics.

use keel_truth::prelude::*;

fn f32_type(truth: &mut Truth) -> TypeIndex {
    truth
        .create_type("scalar_holder", vec![PropertyDef::new("x", PropertyKind::F32)])
        .unwrap()
}

// -- override & clear -------------------------------------------------------

#[test]
fn prototype_override_and_clear() {
    let mut truth = Truth::new();
    let ty = f32_type(&mut truth);

    // Create A with x = 1.0.
    let a = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
    let mut w = truth.write(a).unwrap();
    truth.set_f32(&mut w, 0, 1.0);
    truth.commit(w, NO_UNDO_SCOPE);

    // B inherits from A.
    let b = truth.create_object_from_prototype(a, NO_UNDO_SCOPE).unwrap();
    assert_eq!(truth.get_f32(b, 0), 1.0);

    // Override on B; A is unaffected.
    let mut w = truth.write(b).unwrap();
    truth.set_f32(&mut w, 0, 5.0);
    truth.commit(w, NO_UNDO_SCOPE);
    assert_eq!(truth.get_f32(a, 0), 1.0);
    assert_eq!(truth.get_f32(b, 0), 5.0);
    assert!(truth.is_overridden(b, 0));

    // Clearing the override resolves through the prototype again.
    let mut w = truth.write(b).unwrap();
    truth.clear_override(&mut w, 0);
    truth.commit(w, NO_UNDO_SCOPE);
    assert_eq!(truth.get_f32(b, 0), 1.0);
    assert!(!truth.is_overridden(b, 0));
}

#[test]
fn prototype_edits_flow_to_non_overridden_instances() {
    let mut truth = Truth::new();
    let ty = f32_type(&mut truth);
    let proto = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
    let inst = truth.create_object_from_prototype(proto, NO_UNDO_SCOPE).unwrap();

    let mut w = truth.write(proto).unwrap();
    truth.set_f32(&mut w, 0, 7.0);
    truth.commit(w, NO_UNDO_SCOPE);
    assert_eq!(truth.get_f32(inst, 0), 7.0);
}

#[test]
fn clone_does_not_track_the_source() {
    let mut truth = Truth::new();
    let ty = f32_type(&mut truth);
    let src = truth.create_object_of_type(ty, NO_UNDO_SCOPE);
    let mut w = truth.write(src).unwrap();
    truth.set_f32(&mut w, 0, 2.0);
    truth.commit(w, NO_UNDO_SCOPE);

    let copy = truth.clone_object(src, NO_UNDO_SCOPE).unwrap();
    let inst = truth.create_object_from_prototype(src, NO_UNDO_SCOPE).unwrap();

    let mut w = truth.write(src).unwrap();
    truth.set_f32(&mut w, 0, 3.0);
    truth.commit(w, NO_UNDO_SCOPE);

    // The clone froze the value; the instance follows the prototype.
    assert_eq!(truth.get_f32(copy, 0), 2.0);
    assert_eq!(truth.get_f32(inst, 0), 3.0);
    assert!(truth.prototype(copy).is_none());
    assert_eq!(truth.prototype(inst), src);
}

// -- subobject sets ---------------------------------------------------------

struct SetFixture {
    truth: Truth,
    parent_ty: TypeIndex,
    child_ty: TypeIndex,
    children_prop: u32,
    name_prop: u32,
}

fn set_fixture() -> SetFixture {
    let mut truth = Truth::new();
    let child_ty = truth
        .create_type("child", vec![PropertyDef::new("name", PropertyKind::Str)])
        .unwrap();
    let child_hash = truth.types().info(child_ty).name_hash;
    let parent_ty = truth
        .create_type(
            "parent",
            vec![PropertyDef::new("children", PropertyKind::SubobjectSet).with_target(child_hash)],
        )
        .unwrap();
    SetFixture {
        truth,
        parent_ty,
        child_ty,
        children_prop: 0,
        name_prop: 0,
    }
}

fn named_child(fx: &SetFixture, name: &str) -> ObjectId {
    let id = fx.truth.create_object_of_type(fx.child_ty, NO_UNDO_SCOPE);
    let mut w = fx.truth.write(id).unwrap();
    fx.truth.set_string(&mut w, fx.name_prop, name);
    fx.truth.commit(w, NO_UNDO_SCOPE);
    id
}

#[test]
fn subobject_set_instantiation() {
    let fx = set_fixture();
    let truth = &fx.truth;

    // Prototype with two children "a" and "b".
    let p0 = truth.create_object_of_type(fx.parent_ty, NO_UNDO_SCOPE);
    let c1 = named_child(&fx, "a");
    let c2 = named_child(&fx, "b");
    let mut w = truth.write(p0).unwrap();
    truth.add_to_subobject_set(&mut w, fx.children_prop, &[c1, c2]);
    truth.commit(w, NO_UNDO_SCOPE);

    // Instance sees the prototype's children by identity.
    let p1 = truth.create_object_from_prototype(p0, NO_UNDO_SCOPE).unwrap();
    assert_eq!(truth.get_subobject_set(p1, fx.children_prop), vec![c1, c2]);

    // Instantiate c1 in p1 and rename the instance.
    let c1i = truth
        .instantiate_subobject_from_set(p1, fx.children_prop, c1, NO_UNDO_SCOPE)
        .unwrap();
    assert_eq!(truth.prototype(c1i), c1);

    let mut w = truth.write(c1i).unwrap();
    truth.set_string(&mut w, fx.name_prop, "z");
    truth.commit(w, NO_UNDO_SCOPE);

    assert_eq!(truth.get_subobject_set(p1, fx.children_prop), vec![c1i, c2]);
    assert_eq!(&*truth.get_string(c1i, fx.name_prop), "z");
    assert_eq!(&*truth.get_string(c1, fx.name_prop), "a");
}

#[test]
fn set_merge_applies_removed_then_added() {
    let fx = set_fixture();
    let truth = &fx.truth;

    let p0 = truth.create_object_of_type(fx.parent_ty, NO_UNDO_SCOPE);
    let inherited_a = named_child(&fx, "a");
    let inherited_b = named_child(&fx, "b");
    let mut w = truth.write(p0).unwrap();
    truth.add_to_subobject_set(&mut w, fx.children_prop, &[inherited_a, inherited_b]);
    truth.commit(w, NO_UNDO_SCOPE);

    let p1 = truth.create_object_from_prototype(p0, NO_UNDO_SCOPE).unwrap();
    truth
        .remove_from_prototype_subobject_set(p1, fx.children_prop, inherited_a, NO_UNDO_SCOPE)
        .unwrap();
    let local = named_child(&fx, "local");
    let mut w = truth.write(p1).unwrap();
    truth.add_to_subobject_set(&mut w, fx.children_prop, &[local]);
    truth.commit(w, NO_UNDO_SCOPE);

    assert_eq!(
        truth.get_subobject_set(p1, fx.children_prop),
        vec![inherited_b, local]
    );

    // Cancelling the removal brings the inherited element back.
    truth
        .cancel_remove_from_prototype_subobject_set(p1, fx.children_prop, inherited_a, NO_UNDO_SCOPE)
        .unwrap();
    assert_eq!(
        truth.get_subobject_set(p1, fx.children_prop),
        vec![inherited_a, inherited_b, local]
    );
}

#[test]
fn instantiation_across_two_layers_instantiates_the_middle() {
    let fx = set_fixture();
    let truth = &fx.truth;

    let root = truth.create_object_of_type(fx.parent_ty, NO_UNDO_SCOPE);
    let elem = named_child(&fx, "root_elem");
    let mut w = truth.write(root).unwrap();
    truth.add_to_subobject_set(&mut w, fx.children_prop, &[elem]);
    truth.commit(w, NO_UNDO_SCOPE);

    let mid = truth.create_object_from_prototype(root, NO_UNDO_SCOPE).unwrap();
    let leaf = truth.create_object_from_prototype(mid, NO_UNDO_SCOPE).unwrap();

    // Instantiating at the leaf forces an instance in the middle layer, so
    // every prototype pointer goes to the direct prototype's element.
    let leaf_inst = truth
        .instantiate_subobject_from_set(leaf, fx.children_prop, elem, NO_UNDO_SCOPE)
        .unwrap();
    let mid_inst = truth.prototype(leaf_inst);
    assert_ne!(mid_inst, elem);
    assert_eq!(truth.prototype(mid_inst), elem);
    assert_eq!(truth.get_subobject_set(mid, fx.children_prop), vec![mid_inst]);
    assert_eq!(truth.get_subobject_set(leaf, fx.children_prop), vec![leaf_inst]);

    // Values still resolve through the two-instance chain.
    assert_eq!(&*truth.get_string(leaf_inst, fx.name_prop), "root_elem");
}

#[test]
fn clone_deep_copies_subobject_sets() {
    let fx = set_fixture();
    let truth = &fx.truth;

    let p0 = truth.create_object_of_type(fx.parent_ty, NO_UNDO_SCOPE);
    let c = named_child(&fx, "kid");
    let mut w = truth.write(p0).unwrap();
    truth.add_to_subobject_set(&mut w, fx.children_prop, &[c]);
    truth.commit(w, NO_UNDO_SCOPE);

    let copy = truth.clone_object(p0, NO_UNDO_SCOPE).unwrap();
    let copied_children = truth.get_subobject_set(copy, fx.children_prop);
    assert_eq!(copied_children.len(), 1);
    let c_copy = copied_children[0];
    assert_ne!(c_copy, c);
    assert_eq!(&*truth.get_string(c_copy, fx.name_prop), "kid");
    assert_eq!(truth.owner(c_copy), copy);

    // Renaming the original child does not leak into the clone.
    let mut w = truth.write(c).unwrap();
    truth.set_string(&mut w, fx.name_prop, "renamed");
    truth.commit(w, NO_UNDO_SCOPE);
    assert_eq!(&*truth.get_string(c_copy, fx.name_prop), "kid");
}

#[test]
fn subobject_version_ticks_propagate_to_the_root() {
    let fx = set_fixture();
    let truth = &fx.truth;

    let p0 = truth.create_object_of_type(fx.parent_ty, NO_UNDO_SCOPE);
    let c = named_child(&fx, "kid");
    let mut w = truth.write(p0).unwrap();
    truth.add_to_subobject_set(&mut w, fx.children_prop, &[c]);
    truth.commit(w, NO_UNDO_SCOPE);

    let before = truth.version(p0);
    let mut w = truth.write(c).unwrap();
    truth.set_string(&mut w, fx.name_prop, "kid2");
    truth.commit(w, NO_UNDO_SCOPE);
    assert!(truth.version(p0) > before);
}
