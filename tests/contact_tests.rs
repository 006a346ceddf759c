use approx::assert_relative_eq;
use constraint_core::{
    Attachment, Collidable, ContactData, ContactFeed, ContactKind, CoreConfig, DVec3, DenseSolver,
    DynamicEntity, EdgeEdgeContact, EntityId, GeneratorId, MechSystem, PenetratingPoint, RigidTransform,
    SpatialInertia, Side,
};

const FLOOR: [DVec3; 3] = [
    DVec3::new(-10.0, -10.0, 0.0),
    DVec3::new(10.0, -10.0, 0.0),
    DVec3::new(0.0, 10.0, 0.0),
];

struct Scene {
    system: MechSystem,
    node: EntityId,
    generator: GeneratorId,
}

fn scene(config: CoreConfig, height: f64) -> Scene {
    let mut system = MechSystem::new(config);
    let ground = system.add_entity(
        DynamicEntity::frame(RigidTransform::IDENTITY, SpatialInertia::solid_sphere(1.0, 1.0)).fixed(),
    );
    let node = system.add_entity(DynamicEntity::particle(DVec3::new(0.0, 0.0, height), 1.0));
    let cloth = system.add_collidable(Collidable::deformable(&[node]).with_name("cloth"));
    let floor = system.add_collidable(Collidable::rigid(ground, &FLOOR).with_name("floor"));
    let generator = system.add_contact_generator(cloth, floor).expect("generator");
    Scene {
        system,
        node,
        generator,
    }
}

fn penetration(generator: GeneratorId, position: DVec3, depth: f64) -> ContactFeed {
    let mut feed = ContactFeed::new();
    feed.insert(
        generator,
        ContactData {
            points0: vec![PenetratingPoint {
                vertex: 0,
                face: [0, 1, 2],
                coords: None,
                position,
                normal: DVec3::Z,
                depth,
            }],
            ..ContactData::default()
        },
    );
    feed
}

#[test]
fn persistent_contact_keeps_its_identity() {
    let mut s = scene(CoreConfig::default(), -0.01);
    let feed = penetration(s.generator, DVec3::new(0.0, 0.0, -0.01), 0.01);

    let depth = s.system.update_constraints(&feed, true).expect("update");
    assert_relative_eq!(depth, 0.01);
    let generator = s.system.generator(s.generator).expect("generator");
    assert!(generator.structure_changed());
    let contact = generator.contacts().next().expect("contact");
    assert_eq!(contact.kind, ContactKind::VertexBody);
    assert_eq!(contact.key().vertices(), &[(Side::First, 0)]);
    assert_eq!(contact.normal, DVec3::Z);
    assert_eq!(contact.masters().len(), 2);

    s.system.update_constraints(&feed, true).expect("update");
    let generator = s.system.generator(s.generator).expect("generator");
    assert_eq!(generator.num_contacts(), 1);
    assert!(!generator.structure_changed());
    assert!(!generator.contacts().next().expect("contact").added);

    s.system.update_constraints(&ContactFeed::new(), true).expect("update");
    let generator = s.system.generator(s.generator).expect("generator");
    assert_eq!(generator.num_contacts(), 0);
    assert!(generator.structure_changed());
}

#[test]
fn resting_contact_pushes_out_and_enables_friction() {
    let config = CoreConfig {
        gravity: DVec3::new(0.0, 0.0, -9.81),
        contact_friction: 0.5,
        ..CoreConfig::default()
    };
    let mut s = scene(config, -0.01);
    let feed = penetration(s.generator, DVec3::new(0.0, 0.0, -0.01), 0.01);
    let h = 0.01;
    let mut solver = DenseSolver::default();

    let first = s.system.step(h, &feed, &mut solver).expect("step");
    assert_eq!(first.bilateral_rows, 1);
    assert_eq!(first.contact_count, 1);
    // no impulse yet, so no friction set
    assert_eq!(first.friction_sets, 0);
    assert!(first.structure_changed);

    let node = s.system.entities().entity(s.node).expect("node").position();
    assert_relative_eq!(node.z, -config.penetration_tol, epsilon = 1e-12);
    let contact = s.system.generator(s.generator).expect("generator").contacts().next().expect("contact");
    // impulse is stored as a force: push-out plus weight
    assert_relative_eq!(contact.impulse, (0.01 - config.penetration_tol) / (h * h) + 9.81, epsilon = 1e-8);

    let second = s.system.step(h, &feed, &mut solver).expect("step");
    assert_eq!(second.friction_sets, 1);
    assert!(!second.structure_changed);

    s.system.update_constraints(&feed, true).expect("update");
    let system = s.system.assemble().expect("assemble");
    assert_eq!(system.f_info.len(), 1);
    assert_eq!(system.f_info[0].contact_index, 0);
    assert_eq!(system.f_info[0].mu, 0.5);
    assert_eq!(system.dt.cols(), 2);
}

#[test]
fn separating_contact_is_dropped_on_the_next_update() {
    let mut s = scene(CoreConfig::default(), -0.001);
    s.system
        .entities_mut()
        .entity_mut(s.node)
        .expect("node")
        .set_velocity(&[0.0, 0.0, 1.0]);
    let feed = penetration(s.generator, DVec3::new(0.0, 0.0, -0.001), 0.001);
    s.system
        .step(0.01, &feed, &mut DenseSolver::default())
        .expect("step");
    let contact = s.system.generator(s.generator).expect("generator").contacts().next().expect("contact");
    assert!(contact.impulse < 0.0);
    assert!(!contact.active);

    // the detector still reports it, but a separating contact is not reused
    s.system.update_constraints(&feed, true).expect("update");
    assert_eq!(s.system.generator(s.generator).expect("generator").num_contacts(), 0);
}

#[test]
fn friction_below_impulse_threshold_is_skipped() {
    let config = CoreConfig {
        contact_friction: 0.5,
        friction_impulse_threshold: 1e6,
        gravity: DVec3::new(0.0, 0.0, -9.81),
        ..CoreConfig::default()
    };
    let mut s = scene(config, -0.01);
    let feed = penetration(s.generator, DVec3::new(0.0, 0.0, -0.01), 0.01);
    let mut solver = DenseSolver::default();
    s.system.step(0.01, &feed, &mut solver).expect("step");
    let profile = s.system.step(0.01, &feed, &mut solver).expect("step");
    assert_eq!(profile.friction_sets, 0);
}

#[test]
fn contact_on_an_embedded_vertex_acts_on_its_masters() {
    let mut system = MechSystem::default();
    let ground = system.add_entity(
        DynamicEntity::frame(RigidTransform::IDENTITY, SpatialInertia::solid_sphere(1.0, 1.0)).fixed(),
    );
    let a = system.add_entity(DynamicEntity::particle(DVec3::new(-1.0, 0.0, -0.01), 1.0));
    let b = system.add_entity(DynamicEntity::particle(DVec3::new(1.0, 0.0, -0.01), 1.0));
    let skin = system.add_entity(DynamicEntity::particle(DVec3::ZERO, 0.0));
    system
        .attach(Attachment::point_to_points(skin, &[(a, 0.25), (b, 0.75)]))
        .expect("skin");
    let surface = system.add_collidable(Collidable::deformable(&[skin]));
    let floor = system.add_collidable(Collidable::rigid(ground, &FLOOR));
    let generator = system.add_contact_generator(surface, floor).expect("generator");

    let feed = penetration(generator, DVec3::new(0.5, 0.0, -0.01), 0.01);
    system.update_constraints(&feed, true).expect("update");
    let assembled = system.assemble().expect("assemble");
    assert_eq!(assembled.num_bilaterals(), 1);
    let column = assembled.gt.to_dense();
    // rows: a (xyz), b (xyz); the skin vertex itself is dependent
    assert_eq!(column.shape(), (6, 1));
    assert_relative_eq!(column[(2, 0)], 0.25, epsilon = 1e-14);
    assert_relative_eq!(column[(5, 0)], 0.75, epsilon = 1e-14);
}

#[test]
fn edge_edge_contact_weights_both_edges() {
    let mut system = MechSystem::default();
    let nodes: Vec<EntityId> = [
        DVec3::new(-1.0, 0.0, 0.0),
        DVec3::new(1.0, 0.0, 0.0),
        DVec3::new(0.0, -1.0, 0.01),
        DVec3::new(0.0, 1.0, 0.01),
    ]
    .into_iter()
    .map(|p| system.add_entity(DynamicEntity::particle(p, 1.0)))
    .collect();
    let first = system.add_collidable(Collidable::deformable(&nodes[..2]));
    let second = system.add_collidable(Collidable::deformable(&nodes[2..]));
    let generator = system.add_contact_generator(first, second).expect("generator");

    let mut feed = ContactFeed::new();
    feed.insert(
        generator,
        ContactData {
            edge_edge: vec![EdgeEdgeContact {
                edge0: [0, 1],
                edge1: [0, 1],
                s0: 0.5,
                s1: 0.5,
                point0: DVec3::ZERO,
                point1: DVec3::new(0.0, 0.0, 0.01),
                normal: -DVec3::Z,
                depth: 0.01,
            }],
            ..ContactData::default()
        },
    );
    system.update_constraints(&feed, true).expect("update");
    let contact = system.generator(generator).expect("generator").contacts().next().expect("contact");
    assert_eq!(contact.kind, ContactKind::EdgeEdge);
    assert_eq!(contact.key().vertices().len(), 4);
    let weights: f64 = contact.masters().iter().map(|m| m.weight).sum();
    assert_relative_eq!(weights, 0.0, epsilon = 1e-14);
}
