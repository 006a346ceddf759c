use std::sync::{Arc, Mutex};
use std::thread;

use constraint_core::{
    ContactFeed, CouplingKind, DVec3, DenseSolver, DynamicEntity, Joint, MechSystem, RigidTransform,
    SpatialInertia,
};

#[test]
fn mech_system_is_sync_and_send() {
    fn assert_sync_send<T: Sync + Send>() {}
    assert_sync_send::<MechSystem>();
}

#[test]
fn shared_system_steps_across_threads() {
    let mut system = MechSystem::default();
    let body = system.add_entity(DynamicEntity::frame(
        RigidTransform::from_translation(DVec3::X),
        SpatialInertia::solid_sphere(1.0, 0.2),
    ));
    let hinge = Joint::new(CouplingKind::Revolute, system.entities(), body, None, RigidTransform::IDENTITY)
        .expect("hinge");
    system.add_joint(hinge).expect("add");
    system
        .entities_mut()
        .entity_mut(body)
        .expect("body")
        .set_velocity(&[0.0, 1.0, 0.0, 0.0, 0.0, 1.0]);

    let system = Arc::new(Mutex::new(system));
    let mut handles = vec![];
    for _ in 0..4 {
        let system = Arc::clone(&system);
        handles.push(thread::spawn(move || {
            let mut system = system.lock().unwrap();
            system
                .step(1e-3, &ContactFeed::new(), &mut DenseSolver::default())
                .expect("step");
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let system = system.lock().unwrap();
    assert!((system.time() - 4e-3).abs() < 1e-15);
    let pos = system.entities().frame(body).expect("body").pose.translation;
    assert!((pos.length() - 1.0).abs() < 1e-5);
}
