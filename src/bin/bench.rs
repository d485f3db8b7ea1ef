//! Benchmark for flow model building and solving.
//!
//! Run with: cargo run --release --bin bench

use ambulance_routing::capacity::assign_capacities;
use ambulance_routing::config::{SessionConfig, SeverityCounts};
use ambulance_routing::demo_data;
use ambulance_routing::emergency::{generate_emergencies, place_base};
use ambulance_routing::model::FlowModelBuilder;
use ambulance_routing::planner::RoutePlanner;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::Instant;

fn main() {
    let network = demo_data::grid_network();
    let config = SessionConfig::default();

    println!("Benchmark: Multi-Commodity Flow (GRID)");
    println!("  Intersections: {}", network.node_count());
    println!("  Street segments: {}", network.edge_count());
    println!();

    for per_severity in 1..=3 {
        let mut rng = StdRng::seed_from_u64(per_severity as u64);
        let counts = SeverityCounts::new(per_severity, per_severity, per_severity);
        let scenario = assign_capacities(&network, &config.capacity, &mut rng).and_then(|caps| {
            let base = place_base(&network, &mut rng)?;
            let emergencies =
                generate_emergencies(&network, base, &counts, &config.required_speed, &mut rng)?;
            Ok((caps, emergencies))
        });
        let (caps, emergencies) = match scenario {
            Ok(scenario) => scenario,
            Err(e) => {
                eprintln!("Scenario generation failed: {}", e);
                return;
            }
        };

        let build_start = Instant::now();
        let refs: Vec<_> = emergencies.iter().collect();
        let model = FlowModelBuilder::new(&network, &caps, &config.costs).build(&refs);
        let build_time = build_start.elapsed();

        let plan = RoutePlanner::default()
            .with_time_limit(config.solve_time_limit())
            .plan(&network, &caps, &emergencies, &config.costs);

        println!("Emergencies: {}", emergencies.len());
        println!("  Model: {}", model.stats());
        println!("  Build time: {:.2?}", build_time);
        println!("  Solve time: {:.2?} ({} solver calls)", plan.solve_time, plan.solver_calls);
        println!(
            "  Routed: {}/{}  Cost: {:.2}  Status: {}",
            plan.routed_count(),
            emergencies.len(),
            plan.total_cost(),
            plan.status.as_str()
        );
        println!();
    }
}
