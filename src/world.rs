//! The mechanical system: owns every entity and constraint source and runs
//! the per-step pipeline.
//!
//! A step is: update geometric and contact state with engagement, assemble
//! rows in constrainer order, hand the system to a [`ConstraintSolver`],
//! write multipliers back, integrate, then propagate attachments.

use std::collections::BTreeMap;

use nalgebra::{DMatrix, DVector};

use crate::{
    collision::{collidable::Collidable, detector::ContactData, handler::ContactGenerator},
    config::CoreConfig,
    core::{
        entity::{DynamicEntity, EntitySet},
        types::ContactMaterial,
    },
    dynamics::{
        attachment::Attachment,
        attachment_graph::AttachmentGraph,
        constrainer::{
            self, AssemblyContext, Constrainer, ConstrainerHandle, ConstrainerSet, ConstrainerSetMut,
            ConstraintSystem,
        },
        coordinate_coupling::CoordinateCoupling,
        joint::{Joint, JointCoordinateHandle},
        reference_solver::{ConstraintSolver, SolveProblem},
        topology::KinematicTopology,
    },
    error::{CoreError, CoreResult},
    utils::{
        allocator::{Arena, AttachmentId, CollidableId, CouplingId, EntityId, GeneratorId, JointId},
        profiling::{Stage, StageTimer, StepProfile},
    },
};

/// Detector output for one step, per contact generator.
pub type ContactFeed = BTreeMap<GeneratorId, ContactData>;

type Signature = (Vec<(usize, usize)>, Vec<usize>, Vec<(usize, usize)>, Vec<usize>);

pub struct MechSystem {
    pub config: CoreConfig,
    entities: EntitySet,
    attachments: AttachmentGraph,
    joints: Arena<Joint, JointId>,
    couplings: Arena<CoordinateCoupling, CouplingId>,
    collidables: Arena<Collidable, CollidableId>,
    generators: Arena<ContactGenerator, GeneratorId>,
    /// Visit order of every constraint source.
    constrainers: Vec<ConstrainerHandle>,
    topology: KinematicTopology,
    parallel_enabled: bool,
    last_signature: Option<Signature>,
    profile: StepProfile,
    time: f64,
}

impl Default for MechSystem {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

impl MechSystem {
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            entities: EntitySet::new(),
            attachments: AttachmentGraph::new(),
            joints: Arena::new(),
            couplings: Arena::new(),
            collidables: Arena::new(),
            generators: Arena::new(),
            constrainers: Vec::new(),
            topology: KinematicTopology::default(),
            parallel_enabled: cfg!(feature = "parallel"),
            last_signature: None,
            profile: StepProfile::default(),
            time: 0.0,
        }
    }

    /// Builds constrainer columns concurrently when the `parallel` feature is on.
    pub fn set_parallel_enabled(&mut self, enabled: bool) {
        self.parallel_enabled = enabled;
    }

    pub fn parallel_enabled(&self) -> bool {
        self.parallel_enabled
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn profile(&self) -> &StepProfile {
        &self.profile
    }

    pub fn entities(&self) -> &EntitySet {
        &self.entities
    }

    /// Direct state access; call [`MechSystem::update_attachments`] after moving masters.
    pub fn entities_mut(&mut self) -> &mut EntitySet {
        &mut self.entities
    }

    pub fn attachments(&self) -> &AttachmentGraph {
        &self.attachments
    }

    pub fn joints(&self) -> &Arena<Joint, JointId> {
        &self.joints
    }

    pub fn joint(&self, id: JointId) -> CoreResult<&Joint> {
        self.joints.get(id).ok_or(CoreError::UnknownJoint(id))
    }

    pub fn joint_mut(&mut self, id: JointId) -> CoreResult<&mut Joint> {
        self.joints.get_mut(id).ok_or(CoreError::UnknownJoint(id))
    }

    pub fn coupling(&self, id: CouplingId) -> Option<&CoordinateCoupling> {
        self.couplings.get(id)
    }

    pub fn collidable(&self, id: CollidableId) -> Option<&Collidable> {
        self.collidables.get(id)
    }

    pub fn generator(&self, id: GeneratorId) -> Option<&ContactGenerator> {
        self.generators.get(id)
    }

    pub fn generator_mut(&mut self, id: GeneratorId) -> Option<&mut ContactGenerator> {
        self.generators.get_mut(id)
    }

    pub fn constrainers(&self) -> &[ConstrainerHandle] {
        &self.constrainers
    }

    pub fn add_entity(&mut self, entity: DynamicEntity) -> EntityId {
        self.entities.add(entity)
    }

    pub fn attach(&mut self, attachment: Attachment) -> CoreResult<AttachmentId> {
        self.attachments.attach(&mut self.entities, attachment)
    }

    pub fn detach(&mut self, id: AttachmentId) -> CoreResult<Attachment> {
        self.attachments.detach(&mut self.entities, id)
    }

    /// Re-evaluates every dependent entity from its masters.
    pub fn update_attachments(&mut self) -> CoreResult<()> {
        self.attachments.update_pos_states(&mut self.entities)?;
        self.attachments.update_vel_states(&mut self.entities)
    }

    pub fn add_joint(&mut self, mut joint: Joint) -> CoreResult<JointId> {
        joint.update_body_states(&self.entities, true)?;
        let id = self.joints.insert(joint);
        self.constrainers.push(ConstrainerHandle::Joint(id));
        self.rebuild_topology();
        log::debug!("added joint {id:?}");
        Ok(id)
    }

    /// Removes a joint together with every coordinate coupling that references it.
    pub fn remove_joint(&mut self, id: JointId) -> CoreResult<Joint> {
        let joint = self.joints.remove(id).ok_or(CoreError::UnknownJoint(id))?;
        let stale: Vec<CouplingId> = self
            .couplings
            .iter()
            .filter(|(_, c)| c.coordinates().iter().any(|h| h.joint == id))
            .map(|(cid, _)| cid)
            .collect();
        for cid in stale {
            log::warn!("removing coordinate coupling {cid:?} of removed joint {id:?}");
            self.remove_coordinate_coupling(cid);
        }
        self.constrainers.retain(|h| *h != ConstrainerHandle::Joint(id));
        self.rebuild_topology();
        Ok(joint)
    }

    fn rebuild_topology(&mut self) {
        self.topology = KinematicTopology::build(&self.joints, &self.entities);
    }

    pub fn topology(&self) -> &KinematicTopology {
        &self.topology
    }

    /// Whether the joint lies on a closed kinematic loop.
    pub fn joint_within_loop(&self, id: JointId) -> CoreResult<bool> {
        self.topology.within_loop(id).ok_or(CoreError::UnknownJoint(id))
    }

    pub fn joint_coordinate(&self, handle: JointCoordinateHandle) -> CoreResult<f64> {
        handle.value(&self.joints)
    }

    /// Sets a joint coordinate by moving the joint's first body, then
    /// re-evaluates dependent entities. Returns the clamped value.
    pub fn set_joint_coordinate(&mut self, handle: JointCoordinateHandle, value: f64) -> CoreResult<f64> {
        let joint = self
            .joints
            .get_mut(handle.joint)
            .ok_or(CoreError::UnknownJoint(handle.joint))?;
        let clamped = joint.set_coordinate(handle.index, value, &mut self.entities)?;
        self.update_attachments()?;
        Ok(clamped)
    }

    pub fn add_coordinate_coupling(&mut self, mut coupling: CoordinateCoupling) -> CoreResult<CouplingId> {
        for handle in coupling.coordinates() {
            handle.resolve(&self.joints)?;
        }
        coupling.update(&self.joints)?;
        let id = self.couplings.insert(coupling);
        self.constrainers.push(ConstrainerHandle::Coupling(id));
        Ok(id)
    }

    pub fn remove_coordinate_coupling(&mut self, id: CouplingId) -> Option<CoordinateCoupling> {
        self.constrainers.retain(|h| *h != ConstrainerHandle::Coupling(id));
        self.couplings.remove(id)
    }

    pub fn add_collidable(&mut self, collidable: Collidable) -> CollidableId {
        self.collidables.insert(collidable)
    }

    /// Creates the contact generator for a collidable pair. Friction,
    /// compliance and damping come from the surface materials, or the config
    /// when neither surface has one.
    pub fn add_contact_generator(&mut self, first: CollidableId, second: CollidableId) -> CoreResult<GeneratorId> {
        let material = {
            let lookup = |id: CollidableId| {
                self.collidables
                    .get(id)
                    .ok_or(CoreError::UnknownCollidable(id))
            };
            combined_material(lookup(first)?.material, lookup(second)?.material)
        };
        let mut generator = ContactGenerator::new(first, second, &self.config);
        if let Some(material) = material {
            generator = generator.with_material(&material);
        }
        let id = self.generators.insert(generator);
        self.constrainers.push(ConstrainerHandle::Contact(id));
        Ok(id)
    }

    /// Recomputes joint, coupling and (in an engagement pass) contact state.
    ///
    /// Returns the largest penetration over joint limits and contacts.
    pub fn update_constraints(&mut self, contacts: &ContactFeed, set_engaged: bool) -> CoreResult<f64> {
        let _timer = StageTimer::trace(Stage::ConstraintUpdate);
        let mut max_penetration: f64 = 0.0;
        for (_, joint) in self.joints.iter_mut() {
            max_penetration = max_penetration.max(joint.update_body_states(&self.entities, set_engaged)?);
        }
        for (_, coupling) in self.couplings.iter_mut() {
            coupling.update(&self.joints)?;
        }
        if set_engaged {
            let empty = ContactData::default();
            for (id, generator) in self.generators.iter_mut() {
                let data = contacts.get(&id).unwrap_or(&empty);
                let penetration = generator.update(data, &self.collidables, &self.entities, &self.attachments)?;
                max_penetration = max_penetration.max(penetration);
            }
        }
        Ok(max_penetration)
    }

    /// Assembles the constraint system over the currently independent entities.
    pub fn assemble(&mut self) -> CoreResult<ConstraintSystem> {
        let block_sizes = self.entities.assign_solve_indices();
        let ctx = AssemblyContext {
            entities: &self.entities,
            attachments: &self.attachments,
            joints: &self.joints,
        };
        let set = ConstrainerSet {
            joints: &self.joints,
            couplings: &self.couplings,
            generators: &self.generators,
        };
        let mut system = constrainer::assemble(&self.constrainers, &set, &ctx, &block_sizes, self.parallel_enabled)?;

        let signature = system.signature();
        let contacts_changed = self.generators.iter().any(|(_, g)| g.structure_changed());
        system.structure_changed = contacts_changed || self.last_signature.as_ref() != Some(&signature);
        self.last_signature = Some(signature);
        Ok(system)
    }

    /// Hands solved multipliers back to the constrainers.
    pub fn apply_multipliers(
        &mut self,
        system: &ConstraintSystem,
        bilateral: &[f64],
        unilateral: &[f64],
        scale: f64,
    ) -> CoreResult<()> {
        let mut set = ConstrainerSetMut {
            joints: &mut self.joints,
            couplings: &mut self.couplings,
            generators: &mut self.generators,
        };
        constrainer::write_back(system, &mut set, bilateral, unilateral, scale)
    }

    /// Multipliers currently held by the constrainers, in the row order of `system`.
    pub fn constraint_forces(&self, system: &ConstraintSystem) -> (DVector<f64>, DVector<f64>) {
        let set = ConstrainerSet {
            joints: &self.joints,
            couplings: &self.couplings,
            generators: &self.generators,
        };
        let mut bilateral = Vec::with_capacity(system.num_bilaterals());
        for (handle, _) in &system.bilateral_ranges {
            if let Some(c) = set.resolve(*handle) {
                c.bilateral_forces(&mut bilateral);
            }
        }
        let mut unilateral = Vec::with_capacity(system.num_unilaterals());
        for (handle, _) in &system.unilateral_ranges {
            if let Some(c) = set.resolve(*handle) {
                c.unilateral_forces(&mut unilateral);
            }
        }
        (DVector::from_vec(bilateral), DVector::from_vec(unilateral))
    }

    /// Adds `GT lambda + NT theta` to the forces of the independent entities.
    pub fn accumulate_constraint_forces(&mut self, system: &ConstraintSystem) -> CoreResult<()> {
        let (bilateral, unilateral) = self.constraint_forces(system);
        let mut total = system.gt.mul(&bilateral);
        total += system.nt.mul(&unilateral);
        for (bi, id) in self.entities.active().to_vec().into_iter().enumerate() {
            let Some(offset) = self.entities.vel_offset(bi) else {
                continue;
            };
            let entity = self.entities.entity_mut(id)?;
            let n = entity.vel_state_size();
            entity.add_force(&total.as_slice()[offset..offset + n]);
        }
        Ok(())
    }

    /// Per-entity effective mass with dependent inertia moved onto masters.
    pub fn effective_masses(&self) -> CoreResult<BTreeMap<EntityId, DMatrix<f64>>> {
        self.attachments.add_mass_to_masters(&self.entities)
    }

    /// Dense mass matrix over the independent DOFs, including the coupling
    /// that attachments with several masters introduce between them.
    pub fn mass_matrix(&self) -> CoreResult<DMatrix<f64>> {
        let n = self.entities.active_vel_size();
        let mut mass = DMatrix::zeros(n, n);
        for (id, entity) in self.entities.iter() {
            let roots = self.attachments.root_masters(&self.entities, id)?;
            let me = entity.mass_block();
            let placed: Vec<(usize, &DMatrix<f64>)> = roots
                .iter()
                .filter_map(|(root, jac)| {
                    let bi = self.entities.get(*root)?.solve_index()?;
                    Some((self.entities.vel_offset(bi)?, jac))
                })
                .collect();
            for (ri, jr) in &placed {
                for (si, js) in &placed {
                    let block = jr.transpose() * &me * *js;
                    let mut view = mass.view_mut((*ri, *si), (block.nrows(), block.ncols()));
                    view += &block;
                }
            }
        }
        Ok(mass)
    }

    /// First entity whose velocity is non-finite or above the configured limits.
    pub fn first_unstable_entity(&self) -> Option<EntityId> {
        self.entities.first_unstable(
            self.config.translational_velocity_limit,
            self.config.rotational_velocity_limit,
        )
    }

    /// Advances the system by `h`.
    pub fn step(&mut self, h: f64, contacts: &ContactFeed, solver: &mut dyn ConstraintSolver) -> CoreResult<StepProfile> {
        let mut profile = StepProfile::default();
        let mut total = std::time::Duration::ZERO;
        {
            let _total = StageTimer::record(Stage::Step, &mut total);

            {
                let _stage = StageTimer::record(Stage::Update, &mut profile.update_time);
                self.entities.apply_gravity(self.config.gravity);
                self.attachments.apply_forces(&mut self.entities)?;
                self.update_constraints(contacts, true)?;
            }

            let system = {
                let _stage = StageTimer::record(Stage::Assembly, &mut profile.assembly_time);
                self.assemble()?
            };

            let result = {
                let _stage = StageTimer::record(Stage::Solve, &mut profile.solve_time);
                let mass = self.mass_matrix()?;
                let velocity = self.entities.gather_velocities();
                let force = self.entities.gather_forces();
                solver.solve(&SolveProblem {
                    h,
                    mass: &mass,
                    velocity: &velocity,
                    force: &force,
                    system: &system,
                })?
            };

            {
                let _stage = StageTimer::record(Stage::WriteBack, &mut profile.writeback_time);
                self.apply_multipliers(&system, &result.bilateral, &result.unilateral, 1.0 / h)?;
                self.entities.scatter_velocities(&result.velocity);
                self.entities.integrate_active(h);
            }

            {
                let _stage = StageTimer::record(Stage::Propagation, &mut profile.propagation_time);
                self.update_attachments()?;
                self.entities.zero_forces();
            }

            profile.entity_count = self.entities.active().len();
            profile.bilateral_rows = system.num_bilaterals();
            profile.unilateral_rows = system.num_unilaterals();
            profile.friction_sets = system.f_info.len();
            profile.contact_count = self.generators.iter().map(|(_, g)| g.num_contacts()).sum();
            profile.structure_changed = system.structure_changed;
        }
        profile.total_step_time = total;
        self.time += h;

        if log::log_enabled!(log::Level::Debug) {
            profile.report();
        }
        if let Some(id) = self.first_unstable_entity() {
            log::warn!("entity {id:?} became unstable at t = {:.6}", self.time);
        }
        self.profile = profile;
        Ok(profile)
    }

    /// Zeroes the multipliers held by every constrainer.
    pub fn zero_constraint_forces(&mut self) {
        for (_, joint) in self.joints.iter_mut() {
            joint.zero_forces();
        }
        for (_, coupling) in self.couplings.iter_mut() {
            coupling.zero_forces();
        }
        for (_, generator) in self.generators.iter_mut() {
            generator.zero_forces();
        }
    }
}

fn combined_material(a: Option<ContactMaterial>, b: Option<ContactMaterial>) -> Option<ContactMaterial> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.combine_with(&b)),
        (a, b) => a.or(b),
    }
}
