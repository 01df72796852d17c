#![allow(clippy::comparison_to_empty)]

// Run-time settings for a measurement, and yet another config file parser.
//
// The config file is optional; every setting has a default and command line options override the
// file.  Format:
//
//   # comment
//   [sampler]
//   mode = power                 # power | energy
//   interval = 100ms             # <n>us | <n>ms | <n>s, or 0 for collect-once
//   collect-at-end = true        # collect-once only: take a second sample at stop
//
//   [output]
//   directory = /scratch/me/run17
//   prefix = power_usage         # default depends on the mode
//   timestamps = true            # power only: false writes the old value-only lines
//
//   [debug]
//   verbose = false
//   diagnostics = warn           # fatal | warn | ignore, for device description failures

use crate::sampler::SampleMode;
use crate::sink;

use std::io::BufRead;
use std::path::PathBuf;
use std::time::Duration;

// What to do when the diagnostic description of a device (name, PCI, compute mode) can't be
// obtained during start-up enumeration.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DiagnosticPolicy {
    Fatal,
    Warn,
    Ignore,
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub mode: SampleMode,
    // Zero means collect once.
    pub interval: Duration,
    pub collect_at_end: bool,
    pub directory: PathBuf,
    pub prefix: Option<String>,
    pub timestamps: bool,
    pub verbose: bool,
    pub diagnostics: DiagnosticPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        PartialSettings::default().resolve()
    }
}

impl Settings {
    // Power runs and energy runs land in differently named files unless a prefix is given.
    pub fn prefix(&self) -> String {
        match (&self.prefix, self.mode) {
            (Some(p), _) => p.clone(),
            (None, SampleMode::Power) => sink::POWER_PREFIX.to_string(),
            (None, SampleMode::Energy) => sink::ENERGY_PREFIX.to_string(),
        }
    }
}

// Settings as given by one source (the config file, the command line), with None for anything the
// source does not mention.  Sources are layered with `over()` and defaults are filled in by
// `resolve()` only once every source has been applied, so that the default interval follows the
// final mode.
#[derive(Clone, Debug, Default)]
pub struct PartialSettings {
    pub mode: Option<SampleMode>,
    pub interval: Option<Duration>,
    pub collect_at_end: Option<bool>,
    pub directory: Option<PathBuf>,
    pub prefix: Option<String>,
    pub timestamps: Option<bool>,
    pub verbose: Option<bool>,
    pub diagnostics: Option<DiagnosticPolicy>,
}

impl PartialSettings {
    // Values set in `self` win over values set in `base`.
    pub fn over(self, base: PartialSettings) -> PartialSettings {
        PartialSettings {
            mode: self.mode.or(base.mode),
            interval: self.interval.or(base.interval),
            collect_at_end: self.collect_at_end.or(base.collect_at_end),
            directory: self.directory.or(base.directory),
            prefix: self.prefix.or(base.prefix),
            timestamps: self.timestamps.or(base.timestamps),
            verbose: self.verbose.or(base.verbose),
            diagnostics: self.diagnostics.or(base.diagnostics),
        }
    }

    pub fn resolve(self) -> Settings {
        let mode = self.mode.unwrap_or(SampleMode::Power);
        Settings {
            mode,
            interval: self.interval.unwrap_or_else(|| default_interval(mode)),
            collect_at_end: self.collect_at_end.unwrap_or(true),
            directory: self.directory.unwrap_or_else(|| PathBuf::from(".")),
            prefix: self.prefix,
            timestamps: self.timestamps.unwrap_or(true),
            verbose: self.verbose.unwrap_or(false),
            diagnostics: self.diagnostics.unwrap_or(DiagnosticPolicy::Warn),
        }
    }
}

// Energy is collect-once.
pub fn default_interval(mode: SampleMode) -> Duration {
    match mode {
        SampleMode::Power => Duration::from_millis(100),
        SampleMode::Energy => Duration::ZERO,
    }
}

pub fn parse_config(config_file: &str) -> Result<Settings, String> {
    Ok(read_config(config_file)?.resolve())
}

// Command line settings layered over the optional config file.
pub fn load(config_file: Option<&str>, flags: PartialSettings) -> Result<Settings, String> {
    let file = match config_file {
        Some(f) => read_config(f)?,
        None => PartialSettings::default(),
    };
    Ok(flags.over(file).resolve())
}

// The settings a config file mentions, without defaults.
pub fn read_config(config_file: &str) -> Result<PartialSettings, String> {
    let mut settings = PartialSettings::default();

    enum Section {
        None,
        Sampler,
        Output,
        Debug,
    }
    let mut curr_section = Section::None;
    let file = std::fs::File::open(config_file).map_err(|e| format!("{config_file}: {e}"))?;
    for l in std::io::BufReader::new(file).lines() {
        let l = l.map_err(|e| format!("{config_file}: {e}"))?;
        if l.starts_with('#') {
            continue;
        }
        let l = trim_ascii(strip_comment(&l));
        if l.is_empty() {
            continue;
        }
        match l {
            "[sampler]" => {
                curr_section = Section::Sampler;
                continue;
            }
            "[output]" => {
                curr_section = Section::Output;
                continue;
            }
            "[debug]" => {
                curr_section = Section::Debug;
                continue;
            }
            _ if l.starts_with('[') => return Err(format!("Unknown section {l}")),
            _ => {}
        }

        let (name, value) = parse_setting(l)?;
        match curr_section {
            Section::None => return Err("Setting outside section".to_string()),
            Section::Sampler => match name.as_str() {
                "mode" => {
                    settings.mode = Some(parse_mode(&value)?);
                }
                "interval" => {
                    settings.interval = Some(parse_interval("sampler.interval", &value)?);
                }
                "collect-at-end" => {
                    settings.collect_at_end = Some(parse_bool(&value)?);
                }
                _ => return Err(format!("Invalid [sampler] setting name `{name}`")),
            },
            Section::Output => match name.as_str() {
                "directory" => {
                    if value == "" {
                        return Err("output.directory must not be empty".to_string());
                    }
                    settings.directory = Some(PathBuf::from(value));
                }
                "prefix" => {
                    check_prefix(&value)?;
                    settings.prefix = Some(value);
                }
                "timestamps" => {
                    settings.timestamps = Some(parse_bool(&value)?);
                }
                _ => return Err(format!("Invalid [output] setting name `{name}`")),
            },
            Section::Debug => match name.as_str() {
                "verbose" => {
                    settings.verbose = Some(parse_bool(&value)?);
                }
                "diagnostics" => {
                    settings.diagnostics = Some(parse_policy(&value)?);
                }
                _ => return Err(format!("Invalid [debug] setting name `{name}`")),
            },
        }
    }

    Ok(settings)
}

pub fn parse_mode(l: &str) -> Result<SampleMode, String> {
    match l {
        "power" => Ok(SampleMode::Power),
        "energy" => Ok(SampleMode::Energy),
        _ => Err(format!("Invalid mode `{l}` - power or energy required")),
    }
}

pub fn parse_policy(l: &str) -> Result<DiagnosticPolicy, String> {
    match l {
        "fatal" => Ok(DiagnosticPolicy::Fatal),
        "warn" => Ok(DiagnosticPolicy::Warn),
        "ignore" => Ok(DiagnosticPolicy::Ignore),
        _ => Err(format!(
            "Invalid diagnostics policy `{l}` - fatal, warn, or ignore required"
        )),
    }
}

// A bare number is microseconds, as the interval has always been given.
pub fn parse_interval(context: &str, l: &str) -> Result<Duration, String> {
    let (digits, scale) = if let Some(n) = l.strip_suffix("us") {
        (n, 1)
    } else if let Some(n) = l.strip_suffix("ms") {
        (n, 1000)
    } else if let Some(n) = l.strip_suffix('s') {
        (n, 1_000_000)
    } else {
        (l, 1)
    };
    match digits.parse::<u64>() {
        Ok(k) => k
            .checked_mul(scale)
            .map(Duration::from_micros)
            .ok_or_else(|| format!("Interval too large in {context}")),
        Err(_) => Err(format!("Bad interval in {context}")),
    }
}

// The prefix becomes part of a file name.
pub fn check_prefix(value: &str) -> Result<(), String> {
    if value == "" || value.contains('/') || value.contains(' ') {
        return Err("output.prefix must be a non-empty file name without spaces".to_string());
    }
    Ok(())
}

fn parse_setting(l: &str) -> Result<(String, String), String> {
    if let Some((name, value)) = l.split_once('=') {
        let name = trim_ascii(name);
        if name.is_empty()
            || !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err("Illegal character in name".to_string());
        }
        let value = trim_ascii(value);
        if value == "" {
            return Err("Empty string must be quoted".to_string());
        }
        let value = trim_quotes(value)?;
        Ok((name.to_string(), value.to_string()))
    } else {
        Err("Illegal property definition".to_string())
    }
}

fn parse_bool(l: &str) -> Result<bool, String> {
    match l {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(format!("Invalid boolean value {l}")),
    }
}

// Trailing `# ...` comments, unless the # is inside a quoted value.
fn strip_comment(l: &str) -> &str {
    let mut quote = None;
    for (i, c) in l.char_indices() {
        match (quote, c) {
            (None, '#') => return &l[..i],
            (None, '\'' | '"' | '`') => quote = Some(c),
            (Some(q), _) if q == c => quote = None,
            _ => {}
        }
    }
    l
}

fn trim_ascii(l: &str) -> &str {
    l.trim_matches(|c| c == ' ' || c == '\t')
}

fn trim_quotes(l: &str) -> Result<&str, String> {
    // Invariant: l is not empty
    let bs = l.as_bytes();
    if bs[0] == b'\'' || bs[0] == b'"' || bs[0] == b'`' {
        if bs.len() < 2 || bs[0] != bs[bs.len() - 1] {
            Err("Mismatched quotes".to_string())
        } else {
            Ok(&l[1..l.len() - 1])
        }
    } else {
        Ok(l)
    }
}

#[test]
pub fn test_trim() {
    assert!(trim_ascii(" \t abc\t \t") == "abc");
    assert!(trim_ascii("  ") == "");
    assert!(trim_quotes("'abc'").unwrap() == "abc");
    assert!(trim_quotes("abc`").unwrap() == "abc`"); // Only leading quote strips the trailing one
    assert!(trim_quotes("'abc`").is_err());
    assert!(strip_comment("a = 1 # one") == "a = 1 ");
    assert!(strip_comment("a = '#1' # one") == "a = '#1' ");
}

#[test]
pub fn test_parser() {
    let (a, b) = parse_setting(" collect-at-end = true ").unwrap();
    assert!(a == "collect-at-end");
    assert!(b == "true");
    let (a, b) = parse_setting("directory=`/a b/c`").unwrap();
    assert!(a == "directory");
    assert!(b == "/a b/c");
    assert!(parse_setting("zappa").is_err());
    assert!(parse_setting("zappa = ").is_err());
    assert!(parse_setting("zapp! = true").is_err());
    assert!(parse_setting(" = true").is_err());

    assert!(parse_interval("", "0") == Ok(Duration::ZERO));
    assert!(parse_interval("", "100000") == Ok(Duration::from_millis(100)));
    assert!(parse_interval("", "250us") == Ok(Duration::from_micros(250)));
    assert!(parse_interval("", "100ms") == Ok(Duration::from_millis(100)));
    assert!(parse_interval("", "2s") == Ok(Duration::from_secs(2)));
    assert!(parse_interval("", "2m").is_err());
    assert!(parse_interval("", "-5ms").is_err());
    assert!(parse_interval("", "ms").is_err());

    assert!(parse_mode("energy") == Ok(SampleMode::Energy));
    assert!(parse_mode("Power").is_err());
    assert!(parse_policy("ignore") == Ok(DiagnosticPolicy::Ignore));
    assert!(parse_policy("loud").is_err());
    assert!(check_prefix("a/b").is_err());
}

#[test]
pub fn test_parse_config_files() {
    let s = parse_config("src/testdata/gpupower-power.ini").unwrap();
    assert!(s.mode == SampleMode::Power);
    assert!(s.interval == Duration::from_millis(50));
    assert!(s.directory == PathBuf::from("/scratch/run 17"));
    assert!(s.prefix() == "kernel_power");
    assert!(!s.timestamps);
    assert!(s.verbose);
    assert!(s.diagnostics == DiagnosticPolicy::Fatal);

    let s = parse_config("src/testdata/gpupower-energy.ini").unwrap();
    assert!(s.mode == SampleMode::Energy);
    assert!(s.interval == Duration::ZERO);
    assert!(!s.collect_at_end);
    assert!(s.prefix() == "gpu_usage");
    assert!(s.directory == PathBuf::from("."));
    assert!(s.diagnostics == DiagnosticPolicy::Warn);

    assert!(parse_config("src/testdata/gpupower-bad.ini").is_err());
    assert!(parse_config("src/testdata/no-such-file.ini").is_err());
}

#[test]
pub fn test_layering() {
    let file = read_config("src/testdata/gpupower-energy.ini").unwrap();

    // A mode from the command line gets its own default interval, not the file's.
    let flags = PartialSettings {
        mode: Some(SampleMode::Power),
        ..Default::default()
    };
    let s = flags.over(file.clone()).resolve();
    assert!(s.mode == SampleMode::Power);
    assert!(s.interval == Duration::from_millis(100));
    assert!(!s.collect_at_end);
    assert!(s.prefix() == "power_usage");

    // Nothing on the command line: the file decides.
    let s = PartialSettings::default().over(file.clone()).resolve();
    assert!(s.mode == SampleMode::Energy);
    assert!(s.interval == Duration::ZERO);

    // An explicit interval is kept whichever source gives it.
    let flags = PartialSettings {
        interval: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    let s = flags.over(file).resolve();
    assert!(s.mode == SampleMode::Energy);
    assert!(s.interval == Duration::from_millis(20));

    let file = read_config("src/testdata/gpupower-power.ini").unwrap();
    let flags = PartialSettings {
        mode: Some(SampleMode::Energy),
        ..Default::default()
    };
    let s = flags.over(file).resolve();
    assert!(s.interval == Duration::from_millis(50));
    assert!(s.directory == PathBuf::from("/scratch/run 17"));

    let flags = PartialSettings {
        mode: Some(SampleMode::Power),
        ..Default::default()
    };
    let s = load(Some("src/testdata/gpupower-energy.ini"), flags.clone()).unwrap();
    assert!(s.interval == Duration::from_millis(100));
    let s = load(None, flags).unwrap();
    assert!(s.interval == Duration::from_millis(100));
    assert!(load(Some("src/testdata/gpupower-bad.ini"), PartialSettings::default()).is_err());
}
