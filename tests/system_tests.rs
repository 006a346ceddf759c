use approx::assert_relative_eq;
use constraint_core::{
    Collidable, ContactData, ContactFeed, ConstrainerHandle, CoreConfig, CoreError, CouplingKind, DVec3, DenseSolver,
    DynamicEntity, EntityId, Joint, MechSystem, PenetratingPoint, RigidTransform, SpatialInertia,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

/// A pendulum chain hanging from ground, plus a particle resting on a fixed plate.
fn build(rng: &mut StdRng, links: usize) -> (MechSystem, ContactFeed) {
    let mut system = MechSystem::new(CoreConfig {
        gravity: DVec3::new(0.0, 0.0, -9.81),
        ..CoreConfig::default()
    });
    let kinds = [
        CouplingKind::Revolute,
        CouplingKind::Spherical,
        CouplingKind::Universal,
        CouplingKind::Cylindrical,
    ];
    let mut parent: Option<EntityId> = None;
    for i in 0..links {
        let pos = DVec3::new(i as f64 + 0.5, 0.0, 0.0);
        let body = system.add_entity(DynamicEntity::frame(
            RigidTransform::from_translation(pos),
            SpatialInertia::solid_box(rng.gen_range(0.5..2.0), DVec3::new(0.5, 0.05, 0.05)),
        ));
        let kind = kinds[rng.gen_range(0..kinds.len())];
        let pivot = RigidTransform::from_translation(DVec3::new(i as f64, 0.0, 0.0));
        let joint = Joint::new(kind, system.entities(), body, parent, pivot).expect("joint");
        system.add_joint(joint).expect("add");
        parent = Some(body);
    }

    let plate = system.add_entity(
        DynamicEntity::frame(RigidTransform::IDENTITY, SpatialInertia::solid_sphere(1.0, 1.0)).fixed(),
    );
    let node = system.add_entity(DynamicEntity::particle(DVec3::new(0.0, 5.0, -0.002), 1.0));
    let drop = system.add_collidable(Collidable::deformable(&[node]));
    let floor = system.add_collidable(Collidable::rigid(
        plate,
        &[DVec3::new(-1.0, 4.0, 0.0), DVec3::new(1.0, 4.0, 0.0), DVec3::new(0.0, 6.0, 0.0)],
    ));
    let generator = system.add_contact_generator(drop, floor).expect("generator");
    let mut feed = ContactFeed::new();
    feed.insert(
        generator,
        ContactData {
            points0: vec![PenetratingPoint {
                vertex: 0,
                face: [0, 1, 2],
                coords: None,
                position: DVec3::new(0.0, 5.0, -0.002),
                normal: DVec3::Z,
                depth: 0.002,
            }],
            ..ContactData::default()
        },
    );
    (system, feed)
}

#[test]
fn ranges_cover_all_rows_in_visit_order() {
    let mut rng = StdRng::seed_from_u64(3);
    let (mut system, feed) = build(&mut rng, 6);
    system.update_constraints(&feed, true).expect("update");
    let assembled = system.assemble().expect("assemble");

    let mut next = 0;
    for ((handle, range), expected) in assembled.bilateral_ranges.iter().zip(system.constrainers()) {
        assert_eq!(handle, expected);
        assert_eq!(range.start, next);
        next = range.end;
    }
    assert_eq!(next, assembled.num_bilaterals());
    assert_eq!(assembled.gt.cols(), assembled.num_bilaterals());
    assert_eq!(assembled.gt.rows(), 6 * 6 + 3);
    assert!(matches!(
        assembled.bilateral_ranges.last(),
        Some((ConstrainerHandle::Contact(_), _))
    ));
}

#[test]
fn csc_export_matches_dense_layout() {
    let mut rng = StdRng::seed_from_u64(5);
    let (mut system, feed) = build(&mut rng, 4);
    system.update_constraints(&feed, true).expect("update");
    let assembled = system.assemble().expect("assemble");

    let dense = assembled.gt.to_dense();
    let csc = assembled.gt.to_csc();
    assert_eq!((csc.nrows(), csc.ncols()), dense.shape());
    let mut from_csc = nalgebra::DMatrix::zeros(csc.nrows(), csc.ncols());
    for (r, c, v) in csc.triplet_iter() {
        from_csc[(r, c)] += *v;
    }
    assert_relative_eq!(from_csc, dense, epsilon = 1e-15);
}

#[test]
fn parallel_assembly_matches_serial() {
    let mut rng = StdRng::seed_from_u64(9);
    let (mut system, feed) = build(&mut rng, 12);
    system.update_constraints(&feed, true).expect("update");

    system.set_parallel_enabled(false);
    let serial = system.assemble().expect("serial");
    system.set_parallel_enabled(true);
    let parallel = system.assemble().expect("parallel");

    assert_eq!(serial.gt.to_dense(), parallel.gt.to_dense());
    assert_eq!(serial.g_info, parallel.g_info);
    assert_eq!(serial.bilateral_ranges, parallel.bilateral_ranges);
    assert_eq!(serial.unilateral_ranges, parallel.unilateral_ranges);
}

#[test]
fn constraint_forces_hold_the_chain_against_gravity() {
    let mut rng = StdRng::seed_from_u64(13);
    let (mut system, feed) = build(&mut rng, 3);
    let h = 1e-3;
    let mut solver = DenseSolver::default();
    system.step(h, &feed, &mut solver).expect("step");
    assert_relative_eq!(system.time(), h);
    assert!(system.first_unstable_entity().is_none());

    // forces were zeroed at the end of the step
    system.update_constraints(&feed, false).expect("update");
    let assembled = system.assemble().expect("assemble");
    let (bilateral, _) = system.constraint_forces(&assembled);
    assert_eq!(bilateral.len(), assembled.num_bilaterals());
    assert!(bilateral.iter().all(|f| f.is_finite()));

    system.accumulate_constraint_forces(&assembled).expect("accumulate");
    let applied = system.entities().gather_forces();
    assert_relative_eq!(applied, assembled.gt.mul(&bilateral), epsilon = 1e-9);

    system.zero_constraint_forces();
    let (bilateral, _) = system.constraint_forces(&assembled);
    assert!(bilateral.iter().all(|f| *f == 0.0));
}

#[test]
fn short_multiplier_vectors_are_rejected() {
    let mut rng = StdRng::seed_from_u64(11);
    let (mut system, feed) = build(&mut rng, 2);
    system.update_constraints(&feed, true).expect("update");
    let assembled = system.assemble().expect("assemble");
    let rows = assembled.num_bilaterals();
    assert!(rows > 0);

    assert_eq!(
        system.apply_multipliers(&assembled, &[], &[], 1.0),
        Err(CoreError::RowAccounting {
            constrainer: "bilateral multipliers".to_string(),
            reported: rows,
            produced: 0,
        })
    );
    let too_short = vec![1.0; rows - 1];
    assert!(matches!(
        system.apply_multipliers(&assembled, &too_short, &[], 1.0),
        Err(CoreError::RowAccounting { .. })
    ));
    let unilateral = vec![0.0; assembled.num_unilaterals() + 1];
    assert!(matches!(
        system.apply_multipliers(&assembled, &vec![0.0; rows], &unilateral, 1.0),
        Err(CoreError::RowAccounting { .. })
    ));
    system
        .apply_multipliers(&assembled, &vec![0.0; rows], &vec![0.0; assembled.num_unilaterals()], 1.0)
        .expect("matching lengths");
}
