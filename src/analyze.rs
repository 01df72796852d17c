// Post-processing of output files: total energy consumed over the measured region.
//
// - Power files are integrated with the trapezoid rule over the sample timestamps.
// - Energy files hold readings of the driver's cumulative counter; the consumption is the last
//   reading minus the first.
//
// Legacy power files (no timestamps) can't be integrated and are rejected.

use crate::sampler::SampleMode;
use crate::sink::{self, Sample};

use std::path::Path;

const JOULES_PER_KWH: f64 = 3.6e6;

pub fn parse_samples(text: &str) -> Result<Vec<Sample>, String> {
    let mut samples = vec![];
    for (lineno, l) in text.lines().enumerate() {
        let l = l.trim();
        if l.is_empty() {
            continue;
        }
        let bad = || format!("Line {}: expected `timestamp,value`, got `{l}`", lineno + 1);
        let (t, v) = l.split_once(',').ok_or_else(bad)?;
        let timestamp_ms = t.trim().parse::<u64>().map_err(|_| bad())?;
        let value = v.trim().parse::<f64>().map_err(|_| bad())?;
        samples.push(Sample {
            timestamp_ms,
            value,
        });
    }
    Ok(samples)
}

pub fn energy_joules(samples: &[Sample], mode: SampleMode) -> Result<f64, String> {
    if samples.len() < 2 {
        return Err(format!("Need at least two samples, found {}", samples.len()));
    }
    match mode {
        SampleMode::Power => Ok(samples
            .windows(2)
            .map(|w| {
                let seconds = (w[1].timestamp_ms as f64 - w[0].timestamp_ms as f64) / 1000.0;
                seconds * (w[0].value + w[1].value) / 2.0
            })
            .sum()),
        SampleMode::Energy => Ok(samples[samples.len() - 1].value - samples[0].value),
    }
}

// Energy runs are written with the gpu_usage prefix by default, anything else is taken to be power.
pub fn guess_mode(path: &Path) -> SampleMode {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) if name.starts_with(sink::ENERGY_PREFIX) => SampleMode::Energy,
        _ => SampleMode::Power,
    }
}

pub fn analyze_file(path: &Path, mode: Option<SampleMode>) -> Result<f64, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("{}: {e}", path.display()))?;
    let samples = parse_samples(&text).map_err(|e| format!("{}: {e}", path.display()))?;
    energy_joules(&samples, mode.unwrap_or_else(|| guess_mode(path)))
        .map_err(|e| format!("{}: {e}", path.display()))
}

pub fn report(path: &Path, joules: f64) -> String {
    format!(
        "File: {}, energy consumption = {:.6} J or {:.6} KWH",
        path.display(),
        joules,
        joules / JOULES_PER_KWH
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn s(timestamp_ms: u64, value: f64) -> Sample {
        Sample {
            timestamp_ms,
            value,
        }
    }

    #[test]
    fn test_trapezoid() {
        // 1s at 100W, then 1s ramping from 100W to 200W.
        let samples = vec![s(1000, 100.0), s(2000, 100.0), s(3000, 200.0)];
        let e = energy_joules(&samples, SampleMode::Power).unwrap();
        assert!((e - 250.0).abs() < 1e-9);
    }

    #[test]
    fn test_energy_delta() {
        let samples = vec![s(1000, 4500.0), s(9000, 4512.25)];
        let e = energy_joules(&samples, SampleMode::Energy).unwrap();
        assert!((e - 12.25).abs() < 1e-9);
    }

    #[test]
    fn test_too_few_samples() {
        assert!(energy_joules(&[s(1, 1.0)], SampleMode::Power).is_err());
        assert!(energy_joules(&[], SampleMode::Energy).is_err());
    }

    #[test]
    fn test_parse() {
        let got = parse_samples("10,1.500\n\n20,2.000\n").unwrap();
        assert!(got == vec![s(10, 1.5), s(20, 2.0)]);
        assert!(parse_samples("125.000\n").is_err());
        assert!(parse_samples("10,abc\n").is_err());
    }

    #[test]
    fn test_guess_and_report() {
        assert!(guess_mode(Path::new("/x/gpu_usage_rank0_gpu0.txt")) == SampleMode::Energy);
        assert!(guess_mode(Path::new("power_usage_rank1_gpu1.txt")) == SampleMode::Power);
        let r = report(&PathBuf::from("gpu_usage_rank0_gpu0.txt"), 3.6e6);
        assert!(r == "File: gpu_usage_rank0_gpu0.txt, energy consumption = 3600000.000000 J or 1.000000 KWH");
    }

    #[test]
    fn test_analyze_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gpu_usage_rank0_gpu0.txt");
        std::fs::write(&path, "100,10.000\n200,25.500\n").unwrap();
        assert!(analyze_file(&path, None) == Ok(15.5));
        // Forced to power: 0.1s at an average of 17.75W.
        let e = analyze_file(&path, Some(SampleMode::Power)).unwrap();
        assert!((e - 1.775).abs() < 1e-9);
        assert!(analyze_file(&dir.path().join("missing.txt"), None).is_err());
    }
}
