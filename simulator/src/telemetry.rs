use rand::Rng;
use serde::{Deserialize, Serialize};

/// Counters a roadside unit reports every interval. Values travel as strings,
/// the way the deployed firmware formats them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadsideData {
    pub avg_speed: String,
    pub max_speed: String,
    pub min_speed: String,
    pub num_cars: String,
    pub sensor_1_up: String,
    pub sensor_2_up: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    pub device: String,
    pub version: String,
    pub data: RoadsideData,
}

pub fn generate_telemetry(rng: &mut impl Rng, device: &str, version: &str, deployed: bool) -> Telemetry {
    // A retracted bump cannot count traffic.
    let num_cars = if deployed { rng.gen_range(0..=10) } else { 0 };

    Telemetry {
        device: device.to_string(),
        version: version.to_string(),
        data: RoadsideData {
            avg_speed: format!("{:.2}", rng.gen_range(15.0..100.0)),
            max_speed: format!("{:.2}", rng.gen_range(120.0..150.0)),
            min_speed: format!("{:.2}", rng.gen_range(0.0..15.0)),
            num_cars: num_cars.to_string(),
            sensor_1_up: "1".to_string(),
            sensor_2_up: if rng.gen_bool(0.02) { "0" } else { "1" }.to_string(),
        },
    }
}
