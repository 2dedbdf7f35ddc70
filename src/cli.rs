use anyhow::{Result, anyhow};
use pico_args::Arguments;
use std::{env, path::PathBuf, process::Command};

use crate::config::{DaemonConfigState, Profile};
use crate::ipc;
use crate::replay;
use crate::source::ReplaySource;

pub fn run() -> Result<()> {
    let mut pargs = Arguments::from_env();

    // Hidden daemon mode (spawned by `start`)
    if pargs.contains("--daemon") {
        return ipc::run_daemon();
    }

    // No args -> general help
    if env::args().len() == 1 {
        print_help();
        return Ok(());
    }

    if pargs.contains("-h") || pargs.contains("--help") {
        print_help();
        return Ok(());
    }

    // First free arg is the subcommand
    let subcmd: Option<String> = pargs.free_from_str().ok();

    match subcmd.as_deref() {
        Some("help") => {
            let topic: Option<String> = pargs.free_from_str().ok();
            if let Some(t) = topic {
                print_subcmd_help(&t);
            } else {
                print_help();
            }
            Ok(())
        }

        Some("start") => {
            let exe = std::env::current_exe()?;
            let child = Command::new(exe).arg("--daemon").spawn()?;
            println!("palmscroll: started daemon (pid={})", child.id());
            Ok(())
        }

        Some(op @ ("stop" | "status" | "reload" | "list" | "doctor" | "pause" | "resume")) => {
            let op = if op == "stop" { "shutdown" } else { op };
            let r = ipc::client_request(serde_json::json!({ "op": op }))?;
            print_response(&r);
            Ok(())
        }

        Some("use") => {
            let name: String = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: palmscroll use <profile_name>"))?;
            let r = ipc::client_request(serde_json::json!({"op":"use","profile":name}))?;
            print_response(&r);
            Ok(())
        }

        Some("replay") => {
            // usage:
            //   palmscroll replay session.jsonl
            //   palmscroll replay session.jsonl --profile calm --json
            let json = pargs.contains("--json");
            let profile_name: Option<String> = pargs.opt_value_from_str("--profile")?;
            let path: PathBuf = pargs
                .free_from_str()
                .map_err(|_| anyhow!("usage: palmscroll replay <file.jsonl> [--profile <name>] [--json]"))?;
            run_replay(path, profile_name, json)
        }

        Some(other) => {
            eprintln!("unknown subcommand: {other}\n");
            print_help();
            Ok(())
        }

        None => {
            print_help();
            Ok(())
        }
    }
}

fn run_replay(path: PathBuf, profile_name: Option<String>, json: bool) -> Result<()> {
    let profile = match profile_name {
        Some(name) => {
            let cfg = DaemonConfigState::load_or_install_default()?;
            cfg.profile_named(&name)?
        }
        None => DaemonConfigState::load_or_install_default()
            .map(|c| c.profile)
            .unwrap_or_else(|_| Profile::default()),
    };

    let mut source = ReplaySource::new(path, false);
    let summary = replay::replay(&profile, &mut source, |line| {
        if json {
            println!("{}", serde_json::to_string(line).unwrap_or_default());
        } else {
            println!(
                "#{:<5} hands={} action={:<11} stable={:<5} gesture={:<9} target={:+6.2} v={:+6.2} scrolled={}",
                line.sample,
                line.result.hands_detected,
                format!("{:?}", line.result.gesture_action),
                line.stable,
                line.gesture.as_str(),
                line.target_velocity,
                line.velocity,
                line.scrolled,
            );
        }
    })?;

    if json {
        println!("{}", serde_json::to_string(&summary)?);
    } else {
        println!(
            "replayed {} samples ({} bad), scrolled {}px",
            summary.samples, summary.frame_errors, summary.scrolled
        );
    }
    Ok(())
}

fn print_help() {
    println!(
        r#"palmscroll — hands-free scrolling from camera hand gestures

USAGE:
  palmscroll help [command]              Show general or command-specific help
  palmscroll start                       Start the daemon
  palmscroll stop                        Stop the daemon
  palmscroll status                      Show session state and scroll velocity
  palmscroll pause                       Stop detecting and release the camera
  palmscroll resume                      Start detecting again
  palmscroll reload                      Reload active profile
  palmscroll use <name>                  Switch active profile
  palmscroll list                        List profiles
  palmscroll doctor                      Diagnose camera, helper and uinput
  palmscroll replay <file.jsonl>         Run a recorded landmark session offline

GESTURES:
  one open palm   scroll down
  two open palms  scroll up
  anything else   coast to a stop

TIPS:
  - Profiles: ~/.config/palmscroll/profiles
  - Active profile pointer: ~/.config/palmscroll/active
  - Log level: RUST_LOG=debug palmscroll start
"#
    );
}

fn print_subcmd_help(cmd: &str) {
    match cmd {
        "start" => println!("usage: palmscroll start\nStarts the background daemon."),
        "stop" => println!("usage: palmscroll stop\nStops the running daemon."),
        "status" => println!(
            "usage: palmscroll status\nShows session state, velocity, last detection and active profile."
        ),
        "pause" => println!("usage: palmscroll pause\nStops the session; the camera is released."),
        "resume" => println!("usage: palmscroll resume\nStarts a fresh session."),
        "reload" => println!(
            "usage: palmscroll reload\nReloads the current profile; keeps last good on error."
        ),
        "use" => {
            println!("usage: palmscroll use <name>\nSwitches active profile to <name> and reloads.")
        }
        "list" => {
            println!("usage: palmscroll list\nLists available profiles.")
        }
        "doctor" => println!(
            "usage: palmscroll doctor\nChecks /dev/uinput, group membership, video devices and the landmark helper."
        ),
        "replay" => println!(
            "usage: palmscroll replay <file.jsonl> [--profile <name>] [--json]\nFeeds recorded helper output through the scroll controller without touching the screen."
        ),
        _ => {
            eprintln!("unknown command: {cmd}\n");
            print_help();
        }
    }
}

fn print_response(v: &serde_json::Value) {
    println!("{}", serde_json::to_string_pretty(v).unwrap_or_default());
}
