//! Command line options

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::device::BootTarget;
use crate::errors::LabError;

/// Raw command line: `--key=value`, bare `--flag` and positionals
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    flags: HashMap<String, String>,
    positionals: Vec<String>,
}

impl CliArgs {
    /// Collect arguments, skipping the program name. Keys are normalized to
    /// dashes, so `--flash_retries` and `--flash-retries` are the same flag.
    pub fn parse<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut cli_args = CliArgs::default();
        for arg in args.into_iter().skip(1) {
            let arg = arg.as_ref();
            if let Some(flag) = arg.strip_prefix("--") {
                match flag.split_once('=') {
                    Some((key, value)) => cli_args.flags.insert(normalize(key), value.to_string()),
                    None => cli_args.flags.insert(normalize(flag), "true".to_string()),
                };
            } else {
                cli_args.positionals.push(arg.to_string());
            }
        }
        cli_args
    }

    /// True when any of `names` was given
    pub fn flag(&self, names: &[&str]) -> bool {
        names.iter().any(|name| self.flags.contains_key(&normalize(name)))
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.flags.get(&normalize(name)).map(String::as_str)
    }

    pub fn positionals(&self) -> &[String] {
        &self.positionals
    }

    fn positional(&self, index: usize, what: &str) -> Result<String, LabError> {
        self.positionals
            .get(index)
            .cloned()
            .ok_or_else(|| LabError::ConfigError(format!("Missing argument: {}", what)))
    }

    fn parsed<T: std::str::FromStr>(&self, name: &str) -> Result<Option<T>, LabError> {
        self.value(name)
            .map(|v| {
                v.parse()
                    .map_err(|_| LabError::ConfigError(format!("Invalid value for --{}: {}", name, v)))
            })
            .transpose()
    }

    fn timeout(&self) -> Result<Option<Duration>, LabError> {
        Ok(self.parsed::<u64>("timeout")?.map(Duration::from_secs))
    }
}

fn normalize(key: &str) -> String {
    key.trim_start_matches('-').replace('_', "-").to_lowercase()
}

/// Single-tier run on a lab controller
#[derive(Debug, Clone, Default)]
pub struct FlashOptions {
    /// Model or device name
    pub selector: String,

    pub image: Option<PathBuf>,

    /// Falls back to the settings file when unset
    pub flash_retries: Option<u32>,

    pub record: bool,
    pub no_flash: bool,
    pub emulate_usb: bool,
    pub boot: Option<BootTarget>,
    pub save_ip: bool,

    /// Falls back to the settings file when unset
    pub reserve_timeout: Option<Duration>,

    /// Catalog replacing the default one
    pub catalog: Option<PathBuf>,

    pub test_plan: Option<String>,
}

/// Two-tier run from the front end
#[derive(Debug, Clone, Default)]
pub struct FleetOptions {
    pub selector: String,
    pub image: Option<PathBuf>,
    pub record: bool,
    pub no_flash: bool,
    pub emulate_usb: bool,
    pub no_blacklist: bool,

    /// Flash, then boot into test mode
    pub boot: bool,

    pub save_ip: bool,
    pub reserve_timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub selector: String,

    /// Where the JSON answer is written
    pub results: PathBuf,

    pub reserve_timeout: Option<Duration>,
    pub catalog: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct CutterOptions {
    pub selector: String,
    pub power_on: bool,
    pub catalog: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub enum Command {
    Flash(FlashOptions),
    Fleet(FleetOptions),
    Query(QueryOptions),
    Cutter(CutterOptions),
    Version,
}

const SUBCOMMANDS: &[&str] = &["flash", "fleet", "query", "cutter", "version"];

impl Command {
    /// Build the command; `flash` is implied when no subcommand is named
    pub fn from_args(args: &CliArgs) -> Result<Self, LabError> {
        if args.flag(&["version"]) {
            return Ok(Command::Version);
        }

        let (name, offset) = match args.positionals().first() {
            Some(first) if SUBCOMMANDS.contains(&first.as_str()) => (first.as_str(), 1),
            _ => ("flash", 0),
        };

        match name {
            "version" => Ok(Command::Version),
            "fleet" => Ok(Command::Fleet(FleetOptions {
                selector: args.positional(offset, "device")?,
                image: args.positionals().get(offset + 1).map(PathBuf::from),
                record: args.flag(&["record"]),
                no_flash: args.flag(&["no-flash", "noflash"]),
                emulate_usb: args.flag(&["emulate-usb", "emulateusb"]),
                no_blacklist: args.flag(&["no-black-listing", "no-blacklisting", "no-blacklist"]),
                boot: args.flag(&["boot"]),
                save_ip: args.flag(&["save-ip"]),
                reserve_timeout: args.timeout()?,
            })),
            "query" => Ok(Command::Query(QueryOptions {
                selector: args.positional(offset, "device")?,
                results: PathBuf::from(args.positional(offset + 1, "results")?),
                reserve_timeout: args.timeout()?,
                catalog: args.value("catalog").map(PathBuf::from),
            })),
            "cutter" => {
                let state = args.positional(offset + 1, "on|off")?;
                let power_on = match state.as_str() {
                    "on" => true,
                    "off" => false,
                    other => {
                        return Err(LabError::ConfigError(format!(
                            "Cutter state must be on or off, not {}",
                            other
                        )))
                    }
                };
                Ok(Command::Cutter(CutterOptions {
                    selector: args.positional(offset, "device")?,
                    power_on,
                    catalog: args.value("catalog").map(PathBuf::from),
                }))
            }
            _ => Ok(Command::Flash(FlashOptions {
                selector: args.positional(offset, "machine")?,
                image: args.positionals().get(offset + 1).map(PathBuf::from),
                flash_retries: args.parsed("flash-retries")?,
                record: args.flag(&["record"]),
                no_flash: args.flag(&["no-flash", "noflash"]),
                emulate_usb: args.flag(&["emulate-usb", "emulateusb"]),
                boot: args.parsed("boot")?,
                save_ip: args.flag(&["save-ip"]),
                reserve_timeout: args.timeout()?,
                catalog: args.value("catalog").map(PathBuf::from),
                test_plan: args.value("testplan").map(str::to_string),
            })),
        }
    }
}
