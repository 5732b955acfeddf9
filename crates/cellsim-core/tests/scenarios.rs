//! End-to-end behavior of the partition, cells, perception and policies.

#![allow(clippy::unwrap_used, clippy::float_cmp)]

use std::collections::BTreeSet;
use std::sync::Arc;

use cellsim_cells::{CellState, StimulusBuffer};
use cellsim_core::config::ReorganizationConfig;
use cellsim_core::{
    Coordinator, Environment, EnvironmentSettings, InProcessBus, PerceptionSubscriptionService,
    RandomWalk,
};
use cellsim_space::SpatialIndex;
use cellsim_types::{
    AgentId, AgentRecord, Axis, Bounds, Entity, EventId, EventRecord, ExternalStimulus, HostId,
    Intention, ObjectId, ObjectRecord, RegionId, Shape, SplitStrategy, StructuralChange, Vec3,
    ViewSector,
};

fn world() -> Bounds {
    Bounds::new(Vec3::ZERO, Vec3::new(100.0, 100.0, 10.0)).unwrap()
}

fn settings() -> EnvironmentSettings {
    let mut settings = EnvironmentSettings::for_world(world());
    settings.step.tick_seconds = 1.0;
    settings.threads = 2;
    settings.sibling_offer_threshold = 0.0;
    settings
}

fn agent_at(x: f64, y: f64) -> AgentRecord {
    AgentRecord::new(AgentId::new(), Vec3::new(x, y, 1.0))
}

fn environment(agents: Vec<AgentRecord>) -> Environment {
    let mut root = CellState::new(RegionId::ROOT, world());
    for agent in agents {
        root.insert(Entity::Agent(agent)).unwrap();
    }
    Environment::bootstrap(root, settings(), Arc::new(InProcessBus::new())).unwrap()
}

fn coordinator(split_threshold: f64) -> Coordinator {
    Coordinator::new(
        ReorganizationConfig {
            split_threshold,
            ..ReorganizationConfig::default()
        },
        0.5,
    )
}

fn volume(b: &Bounds) -> f64 {
    Axis::ALL.iter().map(|a| b.extent(*a)).product()
}

fn split_root(env: &Environment) {
    env.enqueue(StructuralChange::Split {
        cell: RegionId::ROOT,
        strategy: SplitStrategy::Midpoint,
    });
    env.run_environment_phase().unwrap();
}

#[test]
fn partition_stays_exact_while_reorganizing() {
    let agents: Vec<AgentRecord> = (0..30_u32)
        .map(|i| {
            let (col, row) = (f64::from(i % 6), f64::from(i / 6));
            agent_at(9.0_f64.mul_add(col, 5.0), 9.0_f64.mul_add(row, 5.0))
        })
        .collect();
    let env = environment(agents);
    let coordinator = coordinator(4.0);
    let walk = RandomWalk::new(3.0, 11);

    for _ in 0..25 {
        coordinator.run_cycle(&env);
        env.run_environment_phase().unwrap();
        env.run_agent_phase(&walk).unwrap();
        env.check_invariants().unwrap();

        let cells = env.snapshots();
        let covered: f64 = cells.iter().map(|c| volume(&c.bounds())).sum();
        assert!((covered - volume(&world())).abs() < 1e-6);
        for (n, a) in cells.iter().enumerate() {
            assert!(world().contains_bounds(&a.bounds()));
            for b in cells.iter().skip(n.saturating_add(1)) {
                assert!(!a.bounds().overlaps(&b.bounds()), "{} overlaps {}", a.region(), b.region());
            }
        }

        let mut seen = BTreeSet::new();
        for cell in &cells {
            for id in cell.agents().keys() {
                assert!(seen.insert(*id), "agent {id} held by two leaves");
            }
        }
        assert_eq!(seen.len(), 30);
    }
    assert!(env.leaf_count() > 1);
}

#[test]
fn split_then_merge_restores_contents_and_bounds() {
    let mut root = CellState::new(RegionId::ROOT, world());
    root.insert(Entity::Agent(agent_at(10.0, 10.0))).unwrap();
    root.insert(Entity::Agent(agent_at(70.0, 40.0))).unwrap();
    let wall = Bounds::new(Vec3::new(45.0, 20.0, 0.0), Vec3::new(55.0, 22.0, 4.0)).unwrap();
    root.insert(Entity::Object(ObjectRecord::new(ObjectId::new(), "wall", wall)))
        .unwrap();
    root.insert(Entity::Event(EventRecord::new(
        EventId::new(),
        "flare",
        Vec3::new(80.0, 80.0, 1.0),
        0,
    )))
    .unwrap();
    let original = root.clone();

    let env = Environment::bootstrap(root, settings(), Arc::new(InProcessBus::new())).unwrap();
    split_root(&env);
    assert_eq!(env.leaf_count(), 2);
    let [low, _] = RegionId::ROOT.children().unwrap();
    env.enqueue(StructuralChange::Merge { cell: low });
    env.run_agent_phase(&cellsim_core::IdleBehavior).unwrap();
    env.run_environment_phase().unwrap();

    let merged = env.snapshot(RegionId::ROOT).unwrap();
    assert!(merged.bounds().approx_eq(&original.bounds()));
    let ids = |c: &CellState| {
        (
            c.agents().keys().copied().collect::<BTreeSet<_>>(),
            c.objects().keys().copied().collect::<BTreeSet<_>>(),
            c.events().keys().copied().collect::<BTreeSet<_>>(),
        )
    };
    assert_eq!(ids(&merged), ids(&original));
}

#[test]
fn regions_intersecting_is_idempotent() {
    let mut index = SpatialIndex::new(world(), HostId::new());
    let host = HostId::new();
    let (low, high) = world().split_at(Axis::X, 50.0).unwrap();
    let [r0, _] = index.split(RegionId::ROOT, low, high, host).unwrap();
    let (a, b) = low.split_at(Axis::Y, 50.0).unwrap();
    index.split(r0, a, b, host).unwrap();

    let view = Shape::Sector(ViewSector::new(
        Vec3::new(30.0, 40.0, 1.0),
        0.5,
        core::f64::consts::FRAC_PI_2,
        40.0,
    ));
    let first = index.regions_intersecting(r0, &view);
    let second = index.regions_intersecting(r0, &view);
    assert_eq!(first, second);
    assert_eq!(first, index.regions_intersecting(RegionId::ROOT, &view));
}

#[test]
fn agent_on_split_plane_goes_to_high_child_only() {
    let on_plane = agent_at(50.0, 30.0);
    let id = on_plane.id;
    let env = environment(vec![on_plane]);
    split_root(&env);
    let [low, high] = RegionId::ROOT.children().unwrap();
    assert!(env.snapshot(low).unwrap().agent(id).is_none());
    assert!(env.snapshot(high).unwrap().agent(id).is_some());
    assert_eq!(env.locate_agent(id), Some(high));
}

#[test]
fn scenario_midpoint_split_places_agent_in_low_child() {
    let mut root = CellState::new(RegionId::ROOT, world());
    let agent = agent_at(10.0, 10.0);
    let id = agent.id;
    root.insert(Entity::Agent(agent)).unwrap();

    let halves = root.split(SplitStrategy::Midpoint).unwrap();
    assert_eq!(halves.axis, Axis::X);
    assert_eq!(halves.coordinate, 50.0);
    let expected_low = Bounds::new(Vec3::ZERO, Vec3::new(50.0, 100.0, 10.0)).unwrap();
    assert!(halves.low.bounds().approx_eq(&expected_low));
    assert!(halves.low.agent(id).is_some());
    assert!(halves.high.agents().is_empty());
}

#[test]
fn scenario_light_siblings_merge_into_one_cell() {
    let agents = vec![
        agent_at(10.0, 10.0),
        agent_at(20.0, 10.0),
        agent_at(30.0, 10.0),
        agent_at(60.0, 10.0),
        agent_at(70.0, 10.0),
    ];
    let env = environment(agents);
    split_root(&env);
    let counts: Vec<usize> = env.snapshots().iter().map(|c| c.agents().len()).collect();
    assert_eq!(counts, vec![3, 2]);

    let change = coordinator(10.0).run_cycle(&env);
    assert!(matches!(change, Some(StructuralChange::Merge { .. })));
    env.run_agent_phase(&cellsim_core::IdleBehavior).unwrap();
    env.run_environment_phase().unwrap();
    assert_eq!(env.leaves(), vec![RegionId::ROOT]);
    assert_eq!(env.snapshot(RegionId::ROOT).unwrap().agents().len(), 5);
}

#[test]
fn scenario_overloaded_cell_is_split_not_merged() {
    let agents = (0..12_u32)
        .map(|i| agent_at(3.0_f64.mul_add(f64::from(i), 5.0), 20.0))
        .collect();
    let env = environment(agents);
    let change = coordinator(10.0).run_cycle(&env);
    assert_eq!(
        change,
        Some(StructuralChange::Split {
            cell: RegionId::ROOT,
            strategy: SplitStrategy::Midpoint,
        })
    );
}

#[test]
fn scenario_combined_view_unions_three_leaves() {
    let viewer = {
        let mut a = agent_at(40.0, 45.0);
        a.kinematics.heading = core::f64::consts::FRAC_PI_4;
        a.vision.field_of_view = core::f64::consts::FRAC_PI_2;
        a.vision.distance = 30.0;
        a
    };
    let neighbor = agent_at(60.0, 48.0);
    let crate_box = ObjectRecord::new(
        ObjectId::new(),
        "crate",
        Bounds::new(Vec3::new(44.0, 60.0, 0.0), Vec3::new(46.0, 62.0, 2.0)).unwrap(),
    );
    let (viewer_id, neighbor_id, crate_id) = (viewer.id, neighbor.id, crate_box.id);

    let mut root = CellState::new(RegionId::ROOT, world());
    root.insert(Entity::Agent(viewer)).unwrap();
    root.insert(Entity::Agent(neighbor)).unwrap();
    root.insert(Entity::Object(crate_box)).unwrap();

    let mut index = SpatialIndex::new(world(), HostId::new());
    let host = HostId::new();
    let first = root.split(SplitStrategy::Midpoint).unwrap();
    index
        .split(RegionId::ROOT, first.low.bounds(), first.high.bounds(), host)
        .unwrap();
    let mut west = first.low;
    let mut east = first.high;
    let second = west.split(SplitStrategy::Midpoint).unwrap();
    index
        .split(west.region(), second.low.bounds(), second.high.bounds(), host)
        .unwrap();
    let mut south = second.low;
    let mut north = second.high;

    let world = world();
    south.deliberate(&[], Vec::new(), 3, &world);
    north.deliberate(&[], Vec::new(), 7, &world);
    east.deliberate(&[], Vec::new(), 5, &world);

    let mut service = PerceptionSubscriptionService::default();
    service.run_pass(&index, &[south.clone(), north.clone(), east.clone()]);

    let view = service.retrieve_combined_state_for(viewer_id).unwrap();
    let expected: BTreeSet<RegionId> = [south.region(), north.region(), east.region()].into();
    assert_eq!(view.sources, expected);
    assert_eq!(view.timestamp, 7);
    assert!(view.agents.contains_key(&viewer_id));
    assert!(view.agents.contains_key(&neighbor_id));
    assert!(view.objects.contains_key(&crate_id));
}

#[test]
fn scenario_conflicting_moves_earlier_id_wins() {
    let mut pair = [agent_at(10.0, 10.0), agent_at(14.0, 10.0)];
    pair.sort_by_key(|a| a.id);
    let [first, second] = pair;
    let (first_id, second_id) = (first.id, second.id);
    let second_start = second.position();

    let mut cell = CellState::new(RegionId::ROOT, world());
    cell.insert(Entity::Agent(first.clone())).unwrap();
    cell.insert(Entity::Agent(second)).unwrap();

    // Both head for the midpoint between them.
    let target = Vec3::new(12.0, 10.0, 1.0);
    let mut buffer = StimulusBuffer::new();
    buffer.push_intention(Intention::moving(first_id, target - first.position()));
    buffer.push_intention(Intention::moving(second_id, target - second_start));

    let proposals = cell.react(&buffer, 1.0);
    let report = cell.deliberate(&proposals, Vec::new(), 1, &world());
    assert_eq!(report.rejected, 1);
    assert_eq!(cell.agent(first_id).unwrap().position(), target);
    assert_eq!(cell.agent(second_id).unwrap().position(), second_start);
    assert_eq!(
        cell.agent(second_id).unwrap().collisions.latest().map(|c| c.tick),
        Some(1)
    );
}

fn next_tick(env: &Environment) {
    env.run_agent_phase(&cellsim_core::IdleBehavior).unwrap();
    env.run_environment_phase().unwrap();
}

fn block(min: (f64, f64), max: (f64, f64)) -> ObjectRecord {
    ObjectRecord::new(
        ObjectId::new(),
        "block",
        Bounds::new(Vec3::new(min.0, min.1, 0.0), Vec3::new(max.0, max.1, 4.0)).unwrap(),
    )
}

fn holders(env: &Environment, object: ObjectId) -> Vec<RegionId> {
    env.snapshots()
        .iter()
        .filter(|c| c.objects().contains_key(&object))
        .map(CellState::region)
        .collect()
}

#[test]
fn scenario_wall_in_neighbouring_leaf_stops_crossing_agent() {
    let walker = agent_at(49.0, 10.0);
    let id = walker.id;
    let env = environment(vec![walker]);
    split_root(&env);
    let [low, high] = RegionId::ROOT.children().unwrap();
    let wall = block((50.8, 0.0), (52.0, 100.0));
    let wall_id = wall.id;
    env.route_stimulus(ExternalStimulus::Create(Entity::Object(wall)))
        .unwrap();
    next_tick(&env);
    assert_eq!(holders(&env, wall_id), vec![high]);

    env.route_command(Intention::moving(id, Vec3::new(2.0, 0.0, 0.0)))
        .unwrap();
    env.run_agent_phase(&cellsim_core::IdleBehavior).unwrap();
    let report = env.run_environment_phase().unwrap();
    assert_eq!(report.overturned, 1);
    assert_eq!(report.emigrated, 0);
    assert_eq!(env.locate_agent(id), Some(low));
    let walker = env.snapshot(low).unwrap().agent(id).cloned().unwrap();
    assert_eq!(walker.position(), Vec3::new(49.0, 10.0, 1.0));
    assert_eq!(walker.collisions.latest().map(|c| c.tick), Some(report.tick));
}

#[test]
fn scenario_agent_across_the_boundary_blocks_a_mover() {
    let walker = agent_at(49.0, 10.0);
    let sitter = agent_at(51.2, 10.0);
    let (walker_id, sitter_id) = (walker.id, sitter.id);
    let env = environment(vec![walker, sitter]);
    split_root(&env);
    let [low, high] = RegionId::ROOT.children().unwrap();

    env.route_command(Intention::moving(walker_id, Vec3::new(2.0, 0.0, 0.0)))
        .unwrap();
    env.run_agent_phase(&cellsim_core::IdleBehavior).unwrap();
    let report = env.run_environment_phase().unwrap();
    assert_eq!(report.overturned, 1);
    assert_eq!(env.locate_agent(walker_id), Some(low));
    assert_eq!(env.locate_agent(sitter_id), Some(high));

    let cells = env.snapshots();
    let walker = cells.iter().find_map(|c| c.agent(walker_id)).unwrap();
    let sitter = cells.iter().find_map(|c| c.agent(sitter_id)).unwrap();
    assert!(!walker.bounding_box().overlaps(&sitter.bounding_box()));
    assert_eq!(sitter.collisions.latest().map(|c| c.tick), Some(report.tick));
}

#[test]
fn scenario_straddling_creation_is_all_or_nothing() {
    let env = environment(Vec::new());
    split_root(&env);
    let rock = block((40.0, 10.0), (42.0, 12.0));
    let wall = block((41.0, 10.0), (60.0, 11.0));
    let (rock_id, wall_id) = (rock.id, wall.id);
    let [low, _] = RegionId::ROOT.children().unwrap();

    // Routed in the same tick: neither exists yet when the other is checked.
    env.route_stimulus(ExternalStimulus::Create(Entity::Object(rock)))
        .unwrap();
    let targets = env
        .route_stimulus(ExternalStimulus::Create(Entity::Object(wall)))
        .unwrap();
    assert_eq!(targets.len(), 2);
    next_tick(&env);

    assert_eq!(holders(&env, rock_id), vec![low]);
    assert!(holders(&env, wall_id).is_empty());
    env.check_invariants().unwrap();
}

#[test]
fn scenario_modified_object_is_placed_by_its_new_bounds() {
    let env = environment(Vec::new());
    split_root(&env);
    let [low, high] = RegionId::ROOT.children().unwrap();
    let rock = block((10.0, 10.0), (12.0, 12.0));
    let rock_id = rock.id;
    env.route_stimulus(ExternalStimulus::Create(Entity::Object(rock.clone())))
        .unwrap();
    next_tick(&env);

    let mut stretched = rock;
    stretched.bounds = Bounds::new(Vec3::new(45.0, 10.0, 0.0), Vec3::new(55.0, 12.0, 4.0)).unwrap();
    env.route_stimulus(ExternalStimulus::Modify(Entity::Object(stretched.clone())))
        .unwrap();
    next_tick(&env);

    assert_eq!(holders(&env, rock_id), vec![low, high]);
    for cell in env.snapshots() {
        assert_eq!(cell.objects().get(&rock_id), Some(&stretched));
    }
}
