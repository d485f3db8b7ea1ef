//! Colored terminal output for dispatch solves.

use num_format::{Locale, ToFormattedString};
use owo_colors::OwoColorize;
use std::time::Duration;

use crate::emergency::{Emergency, Severity};
use crate::model::ModelStats;
use crate::planner::{DispatchPlan, EmergencyOutcome};

/// Width of the summary box content area.
const BOX_CONTENT: usize = 56;

/// ASCII art banner printed at server startup.
pub fn print_banner() {
    let banner = r#"
     _              _           _
    / \   _ __ ___ | |__  _   _| | __ _ _ __   ___ ___
   / _ \ | '_ ` _ \| '_ \| | | | |/ _` | '_ \ / __/ _ \
  / ___ \| | | | | | |_) | |_| | | (_| | | | | (_|  __/
 /_/   \_\_| |_| |_|_.__/ \__,_|_|\__,_|_| |_|\___\___|
"#;
    println!("{}", banner.bright_red().bold());
    println!(
        "  {} {}\n",
        format!("v{}", env!("CARGO_PKG_VERSION")).bright_black(),
        "Ambulance Routing".bright_cyan()
    );
}

/// Prints the size of a freshly loaded street network.
pub fn print_network(source: &str, nodes: usize, edges: usize) {
    println!(
        "{} {} {} Network {}: intersections ({}), street segments ({})",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Network]".bright_cyan(),
        source.white().bold(),
        nodes.to_formatted_string(&Locale::en).bright_yellow(),
        edges.to_formatted_string(&Locale::en).bright_yellow()
    );
}

/// Prints the emergencies about to be routed.
pub fn print_problem(emergencies: &[Emergency]) {
    let count = |s: Severity| emergencies.iter().filter(|e| e.severity == s).count();
    println!(
        "{} {} {} Problem: emergencies ({}), leve ({}), media ({}), crítica ({})",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Planner]".bright_cyan(),
        emergencies.len().to_formatted_string(&Locale::en).bright_yellow(),
        count(Severity::Leve).to_string().green(),
        count(Severity::Media).to_string().yellow(),
        count(Severity::Critica).to_string().red()
    );
}

/// Prints model size: variables and constraints.
pub fn print_model(stats: &ModelStats) {
    println!(
        "{} {} {} Model: commodities ({}), variables ({}), conservation rows ({}), exclusivity rows ({})",
        timestamp().bright_black(),
        "INFO".bright_green(),
        "[Model]".bright_cyan(),
        stats.commodities.to_formatted_string(&Locale::en).bright_yellow(),
        stats.variables.to_formatted_string(&Locale::en).bright_magenta(),
        stats.conservation_constraints.to_formatted_string(&Locale::en).white(),
        stats.exclusivity_constraints.to_formatted_string(&Locale::en).white()
    );
}

/// Prints one line per emergency and a summary box.
pub fn print_plan(plan: &DispatchPlan, emergencies: &[Emergency]) {
    for (e, outcome) in emergencies.iter().zip(&plan.outcomes) {
        let name = format!("{:<4}", e.name());
        let severity = match e.severity {
            Severity::Leve => e.severity.label().green().to_string(),
            Severity::Media => e.severity.label().yellow().to_string(),
            Severity::Critica => e.severity.label().red().to_string(),
        };
        let detail = match outcome {
            EmergencyOutcome::Routed(route) => format!(
                "{} segments, {:.2} km, {}, cost {:.1}",
                route.edges.len(),
                route.distance_km(),
                format_duration(Duration::from_secs_f64(route.travel_time_s.max(0.0))),
                route.cost
            )
            .white()
            .to_string(),
            EmergencyOutcome::Infeasible(reason) => reason.as_str().bright_red().to_string(),
            EmergencyOutcome::Unsolved(status) => status.as_str().yellow().to_string(),
            EmergencyOutcome::Inconsistent(err) => err.to_string().bright_red().to_string(),
        };
        println!("    {} {} {:<8} │ {}", "→".bright_blue(), name.white(), severity, detail);
    }

    let all_routed = plan.routed_count() == plan.outcomes.len();

    println!();
    println!("{}", format!("╔{}╗", "═".repeat(BOX_CONTENT + 2)).bright_cyan());

    let status_text = if all_routed {
        "✓ ALL EMERGENCIES ROUTED".to_string()
    } else {
        format!(
            "✗ {} OF {} EMERGENCIES ROUTED",
            plan.routed_count(),
            plan.outcomes.len()
        )
    };
    let status_colored = if all_routed {
        status_text.bright_green().bold().to_string()
    } else {
        status_text.bright_red().bold().to_string()
    };
    let padding = (BOX_CONTENT + 2).saturating_sub(status_text.chars().count());
    let left = padding / 2;
    println!(
        "{}{}{}{}{}",
        "║".bright_cyan(),
        " ".repeat(left),
        status_colored,
        " ".repeat(padding - left),
        "║".bright_cyan()
    );

    println!("{}", format!("╠{}╣", "═".repeat(BOX_CONTENT + 2)).bright_cyan());
    summary_row("Solver Status:", plan.status.as_str());
    summary_row("Total Cost:", &format!("{:.2}", plan.total_cost()));
    summary_row(
        "Total Distance:",
        &format!("{:.2} km", plan.total_distance_m() / 1000.0),
    );
    summary_row("Solver Calls:", &plan.solver_calls.to_string());
    summary_row("Solving Time:", &format_duration(plan.solve_time));
    println!("{}", format!("╚{}╝", "═".repeat(BOX_CONTENT + 2)).bright_cyan());
    println!();
}

fn summary_row(label: &str, value: &str) {
    println!(
        "{}  {:<18}{:>36}  {}",
        "║".bright_cyan(),
        label,
        value,
        "║".bright_cyan()
    );
}

/// Formats a duration nicely.
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms < 1000 {
        format!("{}ms", total_ms)
    } else if total_ms < 60_000 {
        format!("{:.2}s", d.as_secs_f64())
    } else {
        let mins = total_ms / 60_000;
        let secs = (total_ms % 60_000) / 1000;
        format!("{}m {}s", mins, secs)
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.50s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
    }
}
