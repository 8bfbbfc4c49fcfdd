use crate::client::EcobeeClient;
use crate::models::ecobee::{Selection, Thermostat, ThermostatSummary};
use log::info;

/// One line per registered thermostat, annotated from the summary when available.
pub fn describe(thermostats: &[Thermostat], summaries: &[ThermostatSummary]) -> Vec<String> {
    thermostats
        .iter()
        .map(|t| {
            let base = format!("'{}': ID {}", t.name, t.identifier);
            match summaries.iter().find(|s| s.identifier == t.identifier) {
                Some(s) => {
                    let running = s.equipment.running();
                    format!(
                        "{} ({}, running: {})",
                        base,
                        if s.connected { "connected" } else { "disconnected" },
                        if running.is_empty() {
                            "nothing".to_string()
                        } else {
                            running.join(", ")
                        }
                    )
                }
                None => base,
            }
        })
        .collect()
}

pub fn print_thermostats(client: &EcobeeClient) -> Result<(), String> {
    let thermostats = client
        .get_thermostats(&Selection::registered())
        .map_err(|e| format!("listing thermostats failed: {}", e))?;
    let summaries = client
        .get_thermostat_summary()
        .map_err(|e| format!("fetching thermostat summary failed: {}", e))?;
    info!("Found {} registered thermostat(s)", thermostats.len());

    for line in describe(&thermostats, &summaries) {
        println!("{}", line);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ecobee::fixtures::{load_summary_fixture, load_thermostat_fixture};

    #[test]
    fn lines_include_connection_and_running_equipment() {
        let thermostat = load_thermostat_fixture();
        let mut basement = thermostat.clone();
        basement.identifier = "318324702719".to_string();
        basement.name = "Basement".to_string();
        let mut orphan = thermostat.clone();
        orphan.identifier = "999".to_string();
        orphan.name = "Garage".to_string();
        let summaries = load_summary_fixture().summaries().unwrap();

        let lines = describe(&[thermostat, basement, orphan], &summaries);
        assert_eq!(
            lines,
            vec![
                "'Hallway': ID 318324702718 (connected, running: compCool1, fan)".to_string(),
                "'Basement': ID 318324702719 (disconnected, running: nothing)".to_string(),
                "'Garage': ID 999".to_string(),
            ]
        );
    }
}
