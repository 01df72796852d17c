use subprocess::{Exec, ExitStatus};

#[derive(Debug, Clone, PartialEq)]
pub enum CmdError {
    CouldNotStart(String),
    Killed(u8),
    InternalError,
}

// Run the measured workload with inherited stdio and wait for it.  Returns the exit code; a
// workload that exits non-zero is still a completed workload as far as measuring goes.

pub fn run_workload(argv: &[String]) -> Result<u32, CmdError> {
    let (program, args) = match argv.split_first() {
        Some(x) => x,
        None => return Err(CmdError::CouldNotStart("empty command".to_string())),
    };
    log::debug!("Running workload {argv:?}");
    match Exec::cmd(program).args(args).join() {
        Ok(ExitStatus::Exited(code)) => Ok(code),
        Ok(ExitStatus::Signaled(signal)) => Err(CmdError::Killed(signal)),
        Ok(_) => Err(CmdError::InternalError),
        Err(e) => Err(CmdError::CouldNotStart(format!("{program}: {e}"))),
    }
}

#[test]
fn test_run_workload() {
    let argv = |s: &[&str]| s.iter().map(|x| x.to_string()).collect::<Vec<String>>();
    assert!(run_workload(&argv(&["true"])) == Ok(0));
    assert!(run_workload(&argv(&["sh", "-c", "exit 3"])) == Ok(3));
    assert!(run_workload(&argv(&["sh", "-c", "kill -9 $$"])) == Err(CmdError::Killed(9)));
    assert!(matches!(
        run_workload(&argv(&["no-such-command-we-hope"])),
        Err(CmdError::CouldNotStart(_))
    ));
    assert!(matches!(run_workload(&[]), Err(CmdError::CouldNotStart(_))));
}
