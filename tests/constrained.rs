//! Fallback exit channel: with the constrained-child flag forced on,
//! the wait status is treated as unreliable and every exit fact must
//! arrive over the fd-3 sideband published by the wrapping shell.
//!
//! These tests live in their own binary: the oracle caches the flag at
//! first use, so it must be set before any supervisor runs.
#![cfg(unix)]

use overseer::{Channel, Command};

fn force_constrained() {
    std::env::set_var("OVERSEER_CONSTRAINED_CHILD", "1");
    assert!(overseer::constrained_child());
}

#[test]
fn exit_codes_arrive_over_the_sideband() -> anyhow::Result<()> {
    force_constrained();
    let mut sup = Command::shell("printf code; exit 130").supervise();
    sup.start()?;
    let code = sup.wait()?;
    assert_eq!(code, 130);
    assert_eq!(sup.exit_code(), Some(130));
    assert_eq!(sup.output_string(Channel::Out)?, "code");
    assert!(!sup.is_successful());
    Ok(())
}

#[test]
fn successful_runs_report_zero_through_the_wrapper() -> anyhow::Result<()> {
    force_constrained();
    let mut sup = Command::shell("printf fine").supervise();
    sup.start()?;
    assert_eq!(sup.wait()?, 0);
    assert!(sup.is_successful());
    assert_eq!(sup.output_string(Channel::Out)?, "fine");
    Ok(())
}

#[test]
fn kill_is_reported_as_a_signal_death() -> anyhow::Result<()> {
    force_constrained();
    let mut sup =
        Command::shell("i=0; while true; do echo $i; i=$((i+1)); sleep 0.1; done").supervise();
    sup.start()?;
    let code = sup.wait_with(|sup, _, _| {
        if sup.output_string(Channel::Out)?.contains('2') {
            sup.kill(overseer::KILL_GRACE, None)?;
        }
        Ok(())
    })?;
    assert_eq!(code, 143);
    assert!(sup.is_signaled());
    assert_eq!(sup.term_signal()?, Some(15));
    Ok(())
}

#[test]
fn a_delivered_signal_is_visible_in_the_term_signal() -> anyhow::Result<()> {
    force_constrained();
    let script = "trap 'printf get; exit 0' USR1; \
                  i=0; while [ $i -lt 9 ]; do printf $i; i=$((i+1)); sleep 0.1; done";
    let mut sup = Command::shell(script).supervise();
    sup.start()?;
    let mut sent = false;
    let code = sup.wait_with(|sup, _, _| {
        if !sent && sup.output_string(Channel::Out)?.contains('2') {
            sup.signal(libc::SIGUSR1)?;
            sent = true;
        }
        Ok(())
    })?;
    // the wrapper echoed the handler's clean exit on fd 3, and the
    // delivered signal is surfaced as the termination cause
    assert_eq!(code, 0);
    assert!(sup.is_signaled());
    assert_eq!(sup.term_signal()?, Some(libc::SIGUSR1));
    assert!(sup.output_string(Channel::Out)?.ends_with("get"));
    Ok(())
}

