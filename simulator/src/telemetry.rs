use rand::Rng;
use serde_json::{json, Value};

/// A simulated device on the cloud account
#[derive(Debug, Clone)]
pub struct Device {
    pub mac: String,
    pub name: String,
}

impl Device {
    pub fn fleet(count: usize) -> Vec<Device> {
        (0..count)
            .map(|i| Device {
                mac: format!("58:2D:34:00:{:02X}:{:02X}", i / 256, i % 256),
                name: format!("sim-{}", i),
            })
            .collect()
    }
}

/// Data fields as the cloud reports them, each wrapped in `{"value": ...}`
pub fn generate_fields(rng: &mut impl Rng, timestamp: i64) -> Value {
    let temperature = if rng.gen_bool(0.05) {
        rng.gen_range(-10.0..45.0) // 5% outliers
    } else {
        rng.gen_range(18.0..28.0)
    };

    let humidity = if rng.gen_bool(0.05) {
        rng.gen_range(0.0..100.0) // 5% outliers
    } else {
        rng.gen_range(30.0..70.0)
    };

    let battery: u8 = if rng.gen_bool(0.02) {
        rng.gen_range(0..20) // 2% low battery
    } else {
        rng.gen_range(20..=100)
    };

    // Some firmware reports numbers as strings.
    let pm25 = rng.gen_range(1..80);
    let pm25 = if rng.gen_bool(0.3) {
        json!(pm25.to_string())
    } else {
        json!(pm25)
    };

    json!({
        "temperature": {"value": (temperature * 10.0_f64).round() / 10.0},
        "humidity": {"value": (humidity * 10.0_f64).round() / 10.0},
        "battery": {"value": battery},
        "pm25": {"value": pm25},
        "co2": {"value": rng.gen_range(400..1500)},
        "timestamp": {"value": timestamp}
    })
}

/// Sample times of a device's history inside `[start, end]`, aligned to `interval`
pub fn history_times(start: i64, end: i64, interval: i64) -> impl Iterator<Item = i64> {
    let first = if start % interval == 0 {
        start
    } else {
        start + interval - start.rem_euclid(interval)
    };
    (first..=end).step_by(interval.max(1) as usize)
}
