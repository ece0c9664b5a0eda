//! Manual argv parsing — no argument-parsing crate, matching
//! `original_source/src/main.c::parse_args`'s own `getopt_long` table
//! one flag at a time rather than via a declarative macro.

use skein_core::kprint::LogLevel;

pub struct Parsed {
    pub daemon: bool,
    pub log_level: LogLevel,
    pub log_path: Option<String>,
    pub pid_file: Option<String>,
    pub lualib_path: String,
    pub lualib_cpath: String,
    pub socket_affinity: Option<usize>,
    pub worker_affinity: Option<usize>,
    pub timer_affinity: Option<usize>,
    pub bootstrap: Option<String>,
}

pub enum OptError {
    Help,
    Version,
    Invalid(String),
}

impl Default for Parsed {
    fn default() -> Self {
        Self {
            daemon: false,
            log_level: LogLevel::Info,
            log_path: None,
            pid_file: None,
            lualib_path: String::new(),
            lualib_cpath: String::new(),
            socket_affinity: None,
            worker_affinity: None,
            timer_affinity: None,
            bootstrap: None,
        }
    }
}

fn parse_cpu(arg: &str, name: &str) -> Result<usize, OptError> {
    arg.parse::<usize>()
        .map_err(|_| OptError::Invalid(format!("{} is invalid: {}", name, arg)))
}

/// Parses `argv`, following `main.c`'s own convention: an optional
/// positional script path comes first (only consumed when `argv[1]`
/// doesn't itself start with `-`), every flag after it is a long or
/// short option.
pub fn parse(argv: &[String]) -> Result<Parsed, OptError> {
    let mut parsed = Parsed::default();
    let mut args = argv.iter().skip(1).peekable();

    if let Some(first) = args.peek() {
        if !first.starts_with('-') {
            parsed.bootstrap = Some((*first).clone());
            args.next();
        }
    }

    while let Some(arg) = args.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((f, v)) => (f, Some(v.to_string())),
            None => (arg.as_str(), None),
        };

        let mut value = |name: &str| -> Result<String, OptError> {
            if let Some(v) = &inline_value {
                return Ok(v.clone());
            }
            args.next()
                .cloned()
                .ok_or_else(|| OptError::Invalid(format!("{} requires a value", name)))
        };

        match flag {
            "-h" | "--help" => return Err(OptError::Help),
            "-v" | "--version" => return Err(OptError::Version),
            "-d" | "--daemon" => parsed.daemon = true,
            "-l" | "--log-level" => {
                let v = value("--log-level")?;
                parsed.log_level = match v.as_str() {
                    "debug" => LogLevel::Debug,
                    "info" => LogLevel::Info,
                    "warn" => LogLevel::Warn,
                    "error" => LogLevel::Error,
                    other => {
                        return Err(OptError::Invalid(format!("unknown log level: {}", other)))
                    }
                };
            }
            "--log-path" => parsed.log_path = Some(value("--log-path")?),
            "--pid-file" => parsed.pid_file = Some(value("--pid-file")?),
            "-L" | "--lualib-path" => parsed.lualib_path = value("--lualib-path")?,
            "-C" | "--lualib-cpath" => parsed.lualib_cpath = value("--lualib-cpath")?,
            "-S" | "--socket-affinity" => {
                parsed.socket_affinity = Some(parse_cpu(&value("--socket-affinity")?, "--socket-affinity")?)
            }
            "-W" | "--worker-affinity" => {
                parsed.worker_affinity = Some(parse_cpu(&value("--worker-affinity")?, "--worker-affinity")?)
            }
            "-T" | "--timer-affinity" => {
                parsed.timer_affinity = Some(parse_cpu(&value("--timer-affinity")?, "--timer-affinity")?)
            }
            other => return Err(OptError::Invalid(format!("unknown option: {}", other))),
        }
    }

    Ok(parsed)
}

pub fn print_help(selfname: &str) {
    println!("Usage: {} [script] [options]", selfname);
    println!();
    println!("Modes:");
    println!("  {}                 Start in REPL mode", selfname);
    println!("  {} script          Run a script", selfname);
    println!();
    println!("Options:");
    println!("  -h, --help                Show this help message");
    println!("  -v, --version             Show version");
    println!("  -d, --daemon              Run as a daemon");
    println!("  -l, --log-level LEVEL     Set logging level (debug, info, warn, error)");
    println!("      --log-path PATH       Path for the log file (effective with --daemon)");
    println!("      --pid-file FILE       Path for the PID file (effective with --daemon)");
    println!("  -L, --lualib-path PATH    Path for script libraries (package.path)");
    println!("  -C, --lualib-cpath PATH   Path for native script libraries (package.cpath)");
    println!("  -S, --socket-affinity CPU Bind socket thread to specific CPU core");
    println!("  -W, --worker-affinity CPU Bind worker thread to specific CPU core");
    println!("  -T, --timer-affinity CPU  Bind timer thread to specific CPU core");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(args: &[&str]) -> Vec<String> {
        std::iter::once("skeind".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect()
    }

    #[test]
    fn no_args_is_repl_mode() {
        let parsed = parse(&argv(&[])).ok().unwrap();
        assert!(parsed.bootstrap.is_none());
        assert!(!parsed.daemon);
    }

    #[test]
    fn script_then_flags() {
        let parsed = parse(&argv(&["boot.lua", "--daemon", "-l", "debug"])).ok().unwrap();
        assert_eq!(parsed.bootstrap.as_deref(), Some("boot.lua"));
        assert!(parsed.daemon);
        assert_eq!(parsed.log_level, LogLevel::Debug);
    }

    #[test]
    fn flags_only_no_script() {
        let parsed = parse(&argv(&["-d", "-W", "2"])).ok().unwrap();
        assert!(parsed.bootstrap.is_none());
        assert!(parsed.daemon);
        assert_eq!(parsed.worker_affinity, Some(2));
    }

    #[test]
    fn help_short_circuits() {
        assert!(matches!(parse(&argv(&["-h"])), Err(OptError::Help)));
    }

    #[test]
    fn unknown_flag_is_invalid() {
        assert!(matches!(parse(&argv(&["--bogus"])), Err(OptError::Invalid(_))));
    }

    #[test]
    fn equals_form_accepted() {
        let parsed = parse(&argv(&["--log-level=warn"])).ok().unwrap();
        assert_eq!(parsed.log_level, LogLevel::Warn);
    }
}
