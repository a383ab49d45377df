/// Hashes/second with an SI prefix, padded to a fixed width (e.g. " 25.00 MH/s").
pub fn format_speed(speed: f64) -> String {
    const UNITS: [(f64, &str); 6] = [
        (1e18, "EH/s"),
        (1e15, "PH/s"),
        (1e12, "TH/s"),
        (1e9, "GH/s"),
        (1e6, "MH/s"),
        (1e3, "kH/s"),
    ];
    for (scale, unit) in UNITS {
        if speed >= scale {
            return format!("{:6.2} {}", speed / scale, unit);
        }
    }
    format!("{:6.2}  H/s", speed)
}

pub fn format_speeds(speeds: &[f64]) -> String {
    speeds
        .iter()
        .map(|s| format_speed(*s))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Short duration: "45 s", "60 s" for exactly a minute, otherwise "m:ss".
pub fn format_time(seconds: u64) -> String {
    let (m, s) = (seconds / 60, seconds % 60);
    match (m, s) {
        (1, 0) => "60 s".to_string(),
        (0, s) => format!("{:2} s", s),
        (m, s) => format!("{}:{:02}", m, s),
    }
}

/// BTC/day as mBTC/day
pub fn format_revenue(btc_per_day: f64) -> String {
    format!("{:.4} mBTC/day", btc_per_day * 1e3)
}
