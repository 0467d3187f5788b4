//! Command-line front end.
//!
//! ```text
//! isoscope [--json] inspect <pid>
//! isoscope [--json] ns <pid>
//! isoscope [--json] compare <pid> <pid>
//! isoscope [--json] find <inode> <kind> [limit]
//! isoscope [--json] stats
//! isoscope [--json] run [--name NAME] [--cpu CORES] [--memory MB]
//!                       [--io DEV:RBPS:WBPS] -- <command> [args...]
//! ```
//!
//! `<pid>` accepts the literal `self`. `run` mirrors the child's exit code
//! (128 plus the signal number when it was killed).

use std::process::ExitCode;

use isoscope::executor::{ConfinedExecutor, ExecutionConfig};
use isoscope::namespace::NamespaceKind;
use isoscope::{metrics, namespace, report, Pid};

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match dispatch(&args) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("isoscope: {e}");
            ExitCode::FAILURE
        }
    }
}

fn dispatch(args: &[String]) -> Result<ExitCode, String> {
    let mut args = args;
    let mut json = false;
    if args.first().map(String::as_str) == Some("--json") {
        json = true;
        args = &args[1..];
    }

    let Some(command) = args.first() else {
        print_usage();
        return Ok(ExitCode::FAILURE);
    };
    let rest = &args[1..];

    match command.as_str() {
        "inspect" => cmd_inspect(rest, json),
        "ns" => cmd_ns(rest, json),
        "compare" => cmd_compare(rest, json),
        "find" => cmd_find(rest, json),
        "stats" => cmd_stats(json),
        "run" => cmd_run(rest, json),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(ExitCode::SUCCESS)
        }
        other => Err(format!("unknown command '{other}' (try 'isoscope help')")),
    }
}

fn print_usage() {
    eprintln!("usage: isoscope [--json] <command> [args...]");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  inspect <pid>              cgroup metrics of a process");
    eprintln!("  ns <pid>                   namespace membership of a process");
    eprintln!("  compare <pid> <pid>        compare namespaces of two processes");
    eprintln!("  find <inode> <kind> [max]  processes in a namespace");
    eprintln!("  stats                      system-wide namespace census");
    eprintln!("  run [--name NAME] [--cpu CORES] [--memory MB]");
    eprintln!("      [--io DEV:RBPS:WBPS] -- <command> [args...]");
    eprintln!("                             run a command under resource limits");
    eprintln!();
    eprintln!("<pid> accepts the literal 'self'");
}

fn parse_pid(raw: &str) -> Result<Pid, String> {
    if raw == "self" {
        return Ok(std::process::id());
    }
    raw.parse().map_err(|_| format!("invalid pid '{raw}'"))
}

fn one_pid(args: &[String], what: &str) -> Result<Pid, String> {
    match args {
        [raw] => parse_pid(raw),
        _ => Err(format!("{what} takes exactly one <pid> argument")),
    }
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_inspect(args: &[String], json: bool) -> Result<ExitCode, String> {
    let pid = one_pid(args, "inspect")?;
    let snapshot = metrics::snapshot(pid).map_err(|e| e.to_string())?;

    if json {
        report::write_json(&snapshot, &mut std::io::stdout()).map_err(|e| e.to_string())?;
    } else {
        print!("{}", report::render_snapshot(&snapshot));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_ns(args: &[String], json: bool) -> Result<ExitCode, String> {
    let pid = one_pid(args, "ns")?;
    let set = namespace::list(pid).map_err(|e| e.to_string())?;

    if json {
        report::write_json(&set, &mut std::io::stdout()).map_err(|e| e.to_string())?;
    } else {
        print!("{}", report::render_namespace_set(&set));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_compare(args: &[String], json: bool) -> Result<ExitCode, String> {
    let [raw_a, raw_b] = args else {
        return Err("compare takes exactly two <pid> arguments".to_string());
    };
    let pid_a = parse_pid(raw_a)?;
    let pid_b = parse_pid(raw_b)?;
    let comparisons = namespace::compare(pid_a, pid_b).map_err(|e| e.to_string())?;

    if json {
        report::write_json(&comparisons, &mut std::io::stdout()).map_err(|e| e.to_string())?;
    } else {
        print!("{}", report::render_comparison(pid_a, pid_b, &comparisons));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_find(args: &[String], json: bool) -> Result<ExitCode, String> {
    let (raw_inode, raw_kind, raw_limit) = match args {
        [inode, kind] => (inode, kind, None),
        [inode, kind, limit] => (inode, kind, Some(limit)),
        _ => return Err("find takes <inode> <kind> [max]".to_string()),
    };

    let inode: u64 = raw_inode
        .parse()
        .map_err(|_| format!("invalid inode '{raw_inode}'"))?;
    let kind = NamespaceKind::from_name(raw_kind)
        .ok_or_else(|| format!("unknown namespace kind '{raw_kind}'"))?;
    let limit: usize = match raw_limit {
        Some(raw) => raw.parse().map_err(|_| format!("invalid limit '{raw}'"))?,
        None => 1024,
    };

    let pids = namespace::find_in_namespace(inode, kind, limit).map_err(|e| e.to_string())?;

    if json {
        report::write_json(&pids, &mut std::io::stdout()).map_err(|e| e.to_string())?;
    } else {
        println!("{} process(es) in {kind} namespace {inode}:", pids.len());
        for pid in pids {
            println!("  {pid}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_stats(json: bool) -> Result<ExitCode, String> {
    let stats = namespace::statistics().map_err(|e| e.to_string())?;

    if json {
        report::write_json(&stats, &mut std::io::stdout()).map_err(|e| e.to_string())?;
    } else {
        print!("{}", report::render_statistics(&stats));
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_run(args: &[String], json: bool) -> Result<ExitCode, String> {
    let (config, command) = parse_run_args(args)?;

    let outcome = ConfinedExecutor::new()
        .run(&config, &command)
        .map_err(|e| e.to_string())?;

    if json {
        report::write_json(&outcome, &mut std::io::stdout()).map_err(|e| e.to_string())?;
    } else {
        print!("{}", report::render_execution(&outcome));
    }

    Ok(ExitCode::from(outcome.status.shell_code().clamp(0, 255) as u8))
}

fn parse_run_args(args: &[String]) -> Result<(ExecutionConfig, Vec<String>), String> {
    let mut builder = ExecutionConfig::builder(format!("isoscope-{}", std::process::id()));
    let mut name: Option<String> = None;

    let mut iter = args.iter();
    let command: Vec<String> = loop {
        let Some(arg) = iter.next() else {
            return Err("run requires '--' followed by a command".to_string());
        };
        match arg.as_str() {
            "--" => break iter.cloned().collect(),
            "--name" => {
                name = Some(next_value(&mut iter, "--name")?);
            }
            "--cpu" => {
                let raw = next_value(&mut iter, "--cpu")?;
                let cores: f64 = raw.parse().map_err(|_| format!("invalid --cpu '{raw}'"))?;
                builder = builder.cpu_cores(cores);
            }
            "--memory" => {
                let raw = next_value(&mut iter, "--memory")?;
                let mb: u64 = raw
                    .parse()
                    .map_err(|_| format!("invalid --memory '{raw}'"))?;
                builder = builder.memory_bytes(mb * 1024 * 1024);
            }
            "--io" => {
                let raw = next_value(&mut iter, "--io")?;
                let (device, rbps, wbps) = parse_io_spec(&raw)?;
                builder = builder.io_limit(device, rbps, wbps);
            }
            other => return Err(format!("unknown run option '{other}'")),
        }
    };

    if command.is_empty() {
        return Err("run requires a command after '--'".to_string());
    }

    let mut config = builder.build();
    if let Some(name) = name {
        config.name = name;
    }
    Ok((config, command))
}

fn next_value(iter: &mut std::slice::Iter<'_, String>, flag: &str) -> Result<String, String> {
    iter.next()
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

/// Parse `DEV:RBPS:WBPS`, e.g. `8:0:1048576:1048576` (major:minor device
/// followed by read and write bytes per second)
fn parse_io_spec(raw: &str) -> Result<(String, u64, u64), String> {
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() != 4 {
        return Err(format!(
            "invalid --io '{raw}', expected MAJOR:MINOR:RBPS:WBPS"
        ));
    }
    let device = format!("{}:{}", parts[0], parts[1]);
    let rbps: u64 = parts[2]
        .parse()
        .map_err(|_| format!("invalid read rate in --io '{raw}'"))?;
    let wbps: u64 = parts[3]
        .parse()
        .map_err(|_| format!("invalid write rate in --io '{raw}'"))?;
    Ok((device, rbps, wbps))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn strs(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_pid_self() {
        assert_eq!(parse_pid("self").unwrap(), std::process::id());
        assert_eq!(parse_pid("42").unwrap(), 42);
        assert!(parse_pid("abc").is_err());
    }

    #[test]
    fn test_parse_run_args_full() {
        let args = strs(&[
            "--name", "job", "--cpu", "0.5", "--memory", "256", "--io",
            "8:0:1000:2000", "--", "stress", "--cpu", "1",
        ]);
        let (config, command) = parse_run_args(&args).unwrap();

        assert_eq!(config.name, "job");
        assert_eq!(config.cpu_cores, Some(0.5));
        assert_eq!(config.memory_bytes, Some(256 * 1024 * 1024));
        let io = config.io.unwrap();
        assert_eq!(io.device, "8:0");
        assert_eq!(io.rbps, 1000);
        assert_eq!(io.wbps, 2000);
        assert_eq!(command, strs(&["stress", "--cpu", "1"]));
    }

    #[test]
    fn test_parse_run_args_requires_separator() {
        assert!(parse_run_args(&strs(&["echo", "hi"])).is_err());
        assert!(parse_run_args(&strs(&["--cpu", "1"])).is_err());
        assert!(parse_run_args(&strs(&["--"])).is_err());
    }

    #[test]
    fn test_parse_run_args_default_name() {
        let (config, _) = parse_run_args(&strs(&["--", "true"])).unwrap();
        assert!(config.name.starts_with("isoscope-"));
    }

    #[test]
    fn test_parse_io_spec() {
        let (device, rbps, wbps) = parse_io_spec("8:16:100:200").unwrap();
        assert_eq!(device, "8:16");
        assert_eq!(rbps, 100);
        assert_eq!(wbps, 200);

        assert!(parse_io_spec("8:0:100").is_err());
        assert!(parse_io_spec("8:0:x:y").is_err());
    }
}
