// Run an external program with a time limit, collecting its output.
//
// The child's output pipes have limited capacity and a child that fills them stops, so the pipes
// are drained continuously while we wait for the child to exit; otherwise a chatty child would
// either hang us or hit the time limit.  See https://github.com/rust-lang/rust/issues/45572.

use std::io;
use std::time::Duration;
use subprocess::{Exec, ExitStatus, Redirection};

/// Run `program` with `args`.  Ok carries stdout.  Err carries a description of the failure,
/// which is the child's stderr if it wrote any: output on stderr is a failure even when the exit
/// status is zero.

pub fn run_with_timeout(program: &str, args: &[String], timeout_seconds: u64) -> Result<String, String> {
    let mut p = match Exec::cmd(program)
        .args(args)
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Pipe)
        .popen()
    {
        Ok(p) => p,
        Err(e) => {
            return Err(format!("Could not start {program}: {e}"));
        }
    };

    let mut comm = p
        .communicate_start(None)
        .limit_time(Duration::new(timeout_seconds, 0));
    let mut stdout_result = "".to_string();
    let failed = loop {
        match comm.read_string() {
            Ok((Some(stdout), Some(stderr))) => {
                if !stderr.is_empty() {
                    stdout_result = stderr;
                    break true;
                } else if stdout.is_empty() {
                    // EOF; timeouts are signaled as Err
                    break false;
                } else {
                    stdout_result += &stdout;
                }
            }
            Ok((_, _)) => {
                stdout_result = "Internal error".to_string();
                break true;
            }
            Err(e) => {
                if e.error.kind() == io::ErrorKind::TimedOut {
                    stdout_result = match p.terminate() {
                        Ok(_) => format!("{program} timed out after {timeout_seconds}s"),
                        Err(_) => format!("{program} timed out / internal error"),
                    };
                } else {
                    stdout_result = format!("Communicating with {program}: {}", e.error);
                }
                break true;
            }
        }
    };

    match p.wait() {
        Ok(ExitStatus::Exited(0)) => {
            if failed {
                Err(stdout_result)
            } else {
                Ok(stdout_result)
            }
        }
        Ok(status) => {
            if failed {
                Err(stdout_result)
            } else {
                Err(format!("{program} failed: {status:?}"))
            }
        }
        Err(e) => Err(format!("Waiting for {program}: {e}")),
    }
}

#[test]
fn test_run_ok() {
    let out = run_with_timeout("echo", &["hello".to_string()], 10).unwrap();
    assert!(out == "hello\n");
}

#[test]
fn test_run_stderr_is_failure() {
    let args = vec!["-c".to_string(), "echo oops >&2".to_string()];
    let err = run_with_timeout("sh", &args, 10).unwrap_err();
    assert!(err.contains("oops"));
}

#[test]
fn test_run_exit_status() {
    assert!(run_with_timeout("false", &[], 10).is_err());
    assert!(run_with_timeout("/nonexistent/program", &[], 10).is_err());
}
