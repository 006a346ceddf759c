use constraint_core::{CouplingKind, DVec3, DynamicEntity, EntityId, Joint, JointId, MechSystem, RigidTransform, SpatialInertia};

fn body(system: &mut MechSystem, x: f64) -> EntityId {
    system.add_entity(DynamicEntity::frame(
        RigidTransform::from_translation(DVec3::new(x, 0.0, 0.0)),
        SpatialInertia::solid_sphere(1.0, 0.1),
    ))
}

fn hinge(system: &mut MechSystem, a: EntityId, b: Option<EntityId>, x: f64) -> JointId {
    let joint = Joint::new(
        CouplingKind::Revolute,
        system.entities(),
        a,
        b,
        RigidTransform::from_translation(DVec3::new(x, 0.0, 0.0)),
    )
    .expect("hinge");
    system.add_joint(joint).expect("add")
}

fn in_loop(system: &MechSystem, joints: &[JointId]) -> Vec<bool> {
    joints
        .iter()
        .map(|j| system.joint_within_loop(*j).expect("known joint"))
        .collect()
}

#[test]
fn closing_a_chain_to_ground_puts_every_joint_in_the_loop() {
    let mut system = MechSystem::default();
    let l0 = system.add_entity(
        DynamicEntity::frame(RigidTransform::IDENTITY, SpatialInertia::solid_sphere(1.0, 0.1)).parametric(),
    );
    let l1 = body(&mut system, 1.0);
    let l2 = body(&mut system, 2.0);
    let l3 = body(&mut system, 3.0);
    let chain = [
        hinge(&mut system, l1, Some(l0), 0.5),
        hinge(&mut system, l2, Some(l1), 1.5),
        hinge(&mut system, l3, Some(l2), 2.5),
    ];
    assert_eq!(in_loop(&system, &chain), vec![false; 3]);

    // the parametric base counts as ground, so this closes the loop
    let j4 = hinge(&mut system, l3, None, 3.5);
    assert_eq!(in_loop(&system, &chain), vec![true; 3]);
    assert!(system.joint_within_loop(j4).expect("j4"));
    assert_eq!(system.topology().loop_joints().count(), 4);

    system.remove_joint(j4).expect("remove");
    assert_eq!(in_loop(&system, &chain), vec![false; 3]);
    assert!(system.joint_within_loop(j4).is_err());
}

#[test]
fn side_branch_stays_outside_the_loop() {
    let mut system = MechSystem::default();
    let a = body(&mut system, 0.0);
    let b = body(&mut system, 1.0);
    let c = body(&mut system, 2.0);
    let ga = hinge(&mut system, a, None, -0.5);
    let ab = hinge(&mut system, b, Some(a), 0.5);
    let bg = hinge(&mut system, b, None, 1.5);
    let bc = hinge(&mut system, c, Some(b), 1.5);
    assert_eq!(in_loop(&system, &[ga, ab, bg, bc]), vec![true, true, true, false]);
}
