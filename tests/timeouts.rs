//! Clock enforcement: total and idle timeouts, zero-disables.
#![cfg(unix)]

use overseer::{Channel, Command, ErrorKind, State};
use std::time::{Duration, Instant};

#[test]
fn the_total_clock_kills_a_long_runner() -> anyhow::Result<()> {
    let mut cmd = Command::shell("sleep 5");
    cmd.timeout(Duration::from_millis(300));
    let mut sup = cmd.supervise();
    sup.start()?;
    let begun = Instant::now();
    let err = sup.wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(begun.elapsed() < Duration::from_secs(3));
    assert_eq!(sup.state(), State::Terminated);
    assert!(!sup.is_running());
    Ok(())
}

#[test]
fn the_idle_clock_kills_a_silent_child() -> anyhow::Result<()> {
    let mut cmd = Command::shell("printf a; sleep 5");
    cmd.idle_timeout(Duration::from_millis(300));
    let mut sup = cmd.supervise();
    sup.start()?;
    let err = sup.wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IdleTimeout);
    assert_eq!(sup.output_string(Channel::Out)?, "a");
    assert_eq!(sup.state(), State::Terminated);
    Ok(())
}

#[test]
fn steady_output_keeps_the_idle_clock_alive() -> anyhow::Result<()> {
    let mut cmd =
        Command::shell("i=0; while [ $i -lt 5 ]; do printf $i; i=$((i+1)); sleep 0.1; done");
    cmd.idle_timeout(Duration::from_millis(400));
    let mut sup = cmd.supervise();
    sup.start()?;
    let code = sup.wait()?;
    assert_eq!(code, 0);
    assert_eq!(sup.output_string(Channel::Out)?, "01234");
    Ok(())
}

#[test]
fn zero_disables_both_clocks() -> anyhow::Result<()> {
    let mut cmd = Command::shell("sleep 0.3; printf done");
    cmd.timeout(Duration::from_secs(0))
        .idle_timeout(Duration::from_secs(0));
    let mut sup = cmd.supervise();
    sup.start()?;
    let code = sup.wait()?;
    assert_eq!(code, 0);
    assert_eq!(sup.output_string(Channel::Out)?, "done");
    Ok(())
}
