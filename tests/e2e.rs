//! End-to-end scenarios against real `/bin/sh` children.
#![cfg(unix)]

use overseer::{Channel, Command, ErrorKind, InputChunk, InputSource, Mode, State};
use std::io::Write;
use std::time::Duration;

#[test]
fn string_input_is_echoed_back() -> anyhow::Result<()> {
    let mut cmd = Command::shell("cat");
    cmd.input(InputSource::of("string"));
    let mut sup = cmd.supervise();
    sup.start()?;
    let code = sup.wait()?;
    assert_eq!(code, 0);
    assert!(sup.is_successful());
    assert_eq!(sup.output_string(Channel::Out)?, "string");
    Ok(())
}

#[test]
fn mixed_chunks_concatenate_in_order() -> anyhow::Result<()> {
    let src = InputSource::new();
    src.write("foo_")?;
    src.write("bar_")?;
    src.write("biz")?;
    src.close();
    let mut cmd = Command::shell("cat");
    cmd.input(src);
    let mut sup = cmd.supervise();
    sup.start()?;
    sup.wait()?;
    assert_eq!(sup.output_string(Channel::Out)?, "foo_bar_biz");
    Ok(())
}

#[test]
fn nested_sources_with_dynamic_appends_flatten_depth_first() -> anyhow::Result<()> {
    let mut stream_file = tempfile::tempfile()?;
    stream_file.write_all(b"_stream")?;

    let inner_child = Command::shell("printf _process").supervise();

    let nested = InputSource::new();
    nested.write("_string3")?;
    nested.write(inner_child)?;
    nested.write(InputChunk::sequence(vec![
        InputChunk::from("_arr"),
        InputChunk::from("_arr2"),
        InputChunk::stream(stream_file),
    ]))?;
    nested.close();

    let open_src = InputSource::new();
    open_src.write("_iter1")?;

    let root = InputSource::new();
    root.write("_string1")?;
    root.write("_string2")?;
    root.write(nested)?;
    root.write(open_src.clone())?;
    root.close();

    let mut cmd = Command::shell("cat");
    cmd.input(root);
    let mut sup = cmd.supervise();
    sup.start()?;
    let mut appended = false;
    sup.wait_with(|sup, channel, _| {
        if channel == Channel::Out && !appended {
            let so_far = sup.output_string(Channel::Out)?;
            if so_far.contains("_iter1") {
                open_src.write("_iter2")?;
                open_src.close();
                appended = true;
            }
        }
        Ok(())
    })?;
    assert_eq!(
        sup.output_string(Channel::Out)?,
        "_string1_string2_string3_process_arr_arr2_stream_iter1_iter2"
    );
    Ok(())
}

#[test]
fn kill_during_the_output_loop_reports_sigterm() -> anyhow::Result<()> {
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
    assert_eq!(sup.exit_code(), Some(143));
    assert!(!sup.is_successful());
    Ok(())
}

#[test]
fn a_handled_signal_lets_the_child_exit_cleanly() -> anyhow::Result<()> {
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
    assert_eq!(code, 0);
    assert!(sup.is_successful());
    let out = sup.output_string(Channel::Out)?;
    assert!(out.starts_with("012"), "unexpected prefix: {:?}", out);
    assert!(out.ends_with("get"), "handler did not run: {:?}", out);
    assert_eq!(sup.latest_signal(), Some(libc::SIGUSR1));
    Ok(())
}

#[test]
fn nonzero_exit_codes_propagate() -> anyhow::Result<()> {
    let mut sup = Command::shell("printf code; exit 130").supervise();
    sup.start()?;
    let code = sup.wait()?;
    assert_eq!(code, 130);
    assert_eq!(sup.output_string(Channel::Out)?, "code");
    assert!(!sup.is_successful());
    assert!(!sup.is_signaled());
    Ok(())
}

#[test]
fn argv_form_escapes_each_element() -> anyhow::Result<()> {
    let mut cmd = Command::new("printf");
    cmd.arg("%s").arg("hello world's");
    let mut sup = cmd.supervise();
    sup.start()?;
    sup.wait()?;
    assert_eq!(sup.output_string(Channel::Out)?, "hello world's");
    Ok(())
}

#[test]
fn placeholders_resolve_against_the_configured_environment() -> anyhow::Result<()> {
    let mut cmd = Command::shell("printf %s ${:OVERSEER_TEST_MSG}");
    cmd.env("OVERSEER_TEST_MSG", "a b c");
    let mut sup = cmd.supervise();
    sup.start()?;
    sup.wait()?;
    assert_eq!(sup.output_string(Channel::Out)?, "a b c");
    Ok(())
}

#[test]
fn missing_placeholder_values_fail_before_spawn() {
    let mut sup = Command::shell("printf %s ${:OVERSEER_NOT_SET_ANYWHERE}").supervise();
    let err = sup.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(sup.state(), State::Ready);
}

#[test]
fn configured_env_reaches_the_child() -> anyhow::Result<()> {
    let mut cmd = Command::shell("printf \"${OVERSEER_INJECTED:-unset}\"");
    cmd.env("OVERSEER_INJECTED", "present");
    let mut sup = cmd.supervise();
    sup.start()?;
    sup.wait()?;
    assert_eq!(sup.output_string(Channel::Out)?, "present");
    // the parent's environment was restored after the spawn
    assert!(std::env::var_os("OVERSEER_INJECTED").is_none());
    Ok(())
}

#[test]
fn removed_env_vars_are_absent_for_the_child() -> anyhow::Result<()> {
    std::env::set_var("OVERSEER_TO_REMOVE", "visible");
    let mut cmd = Command::shell("printf \"${OVERSEER_TO_REMOVE:-unset}\"");
    cmd.env_remove("OVERSEER_TO_REMOVE");
    let mut sup = cmd.supervise();
    sup.start()?;
    sup.wait()?;
    assert_eq!(sup.output_string(Channel::Out)?, "unset");
    assert_eq!(
        std::env::var("OVERSEER_TO_REMOVE").as_deref(),
        Ok("visible")
    );
    std::env::remove_var("OVERSEER_TO_REMOVE");
    Ok(())
}

#[test]
fn unlaunchable_children_surface_a_runtime_error() {
    let mut cmd = Command::shell("printf hi");
    cmd.current_dir("/overseer-no-such-directory");
    let mut sup = cmd.supervise();
    let err = sup.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert!(err.to_string().contains("Unable to launch a new process."));
}

#[test]
fn disabled_output_runs_but_rejects_access() -> anyhow::Result<()> {
    let mut cmd = Command::shell("echo hi");
    cmd.mode(Mode::OutputDisabled);
    let mut sup = cmd.supervise();
    sup.start()?;
    let code = sup.wait()?;
    assert_eq!(code, 0);
    assert_eq!(
        sup.output(Channel::Out).unwrap_err().kind(),
        ErrorKind::Logic
    );
    Ok(())
}

#[test]
fn disabled_output_rejects_wait_callbacks() -> anyhow::Result<()> {
    let mut cmd = Command::shell("sleep 0.2");
    cmd.mode(Mode::OutputDisabled);
    let mut sup = cmd.supervise();
    sup.start()?;
    let err = sup.wait_with(|_, _, _| Ok(())).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    sup.wait()?;
    Ok(())
}

#[test]
fn output_access_is_idempotent_and_clearable() -> anyhow::Result<()> {
    let mut sup = Command::shell("printf data; printf trouble >&2").supervise();
    sup.start()?;
    sup.wait()?;
    let first = sup.output(Channel::Out)?;
    let second = sup.output(Channel::Out)?;
    assert_eq!(first, second);
    assert_eq!(first, b"data");
    let mut streamed = String::new();
    std::io::Read::read_to_string(&mut sup.output_reader(Channel::Out)?, &mut streamed)?;
    assert_eq!(streamed, "data");
    assert_eq!(sup.output(Channel::Err)?, b"trouble");
    sup.clear_output(Channel::Out)?;
    assert!(sup.output(Channel::Out)?.is_empty());
    assert_eq!(sup.output(Channel::Err)?, b"trouble");
    Ok(())
}

#[test]
fn state_progresses_and_terminated_is_absorbing() -> anyhow::Result<()> {
    let mut sup = Command::shell("sleep 0.2").supervise();
    assert_eq!(sup.state(), State::Ready);
    sup.start()?;
    assert_eq!(sup.state(), State::Started);
    assert!(sup.is_running());
    sup.wait()?;
    assert_eq!(sup.state(), State::Terminated);
    assert!(!sup.is_running());
    let err = sup.start().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Logic);
    Ok(())
}

#[test]
fn a_clone_reruns_the_same_configuration() -> anyhow::Result<()> {
    let mut sup = Command::shell("printf again").supervise();
    sup.start()?;
    sup.wait()?;
    assert_eq!(sup.output_string(Channel::Out)?, "again");

    let mut rerun = sup.clone();
    assert_eq!(rerun.state(), State::Ready);
    rerun.start()?;
    rerun.wait()?;
    assert_eq!(rerun.output_string(Channel::Out)?, "again");
    Ok(())
}

#[test]
fn config_mutation_while_running_is_rejected() -> anyhow::Result<()> {
    let mut sup = Command::shell("sleep 0.3").supervise();
    sup.start()?;
    let err = sup.set_timeout(Duration::from_secs(1)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    sup.wait()?;
    sup.set_timeout(Duration::from_secs(1))?;
    Ok(())
}

#[test]
fn a_supervisor_can_feed_another_supervisor() -> anyhow::Result<()> {
    let inner = Command::shell("printf inner; printf noise >&2").supervise();
    let src = InputSource::new();
    src.write("[")?;
    src.write(inner)?;
    src.write("]")?;
    src.close();
    let mut cmd = Command::shell("cat");
    cmd.input(src);
    let mut sup = cmd.supervise();
    sup.start()?;
    sup.wait()?;
    // the inner child's stderr is skipped while it feeds the pipeline
    assert_eq!(sup.output_string(Channel::Out)?, "[inner]");
    Ok(())
}

#[test]
fn megabyte_outputs_survive_the_temp_spill() -> anyhow::Result<()> {
    let mut sup =
        Command::shell("head -c 2000000 /dev/zero | tr '\\0' x").supervise();
    sup.start()?;
    sup.wait()?;
    let out = sup.output(Channel::Out)?;
    assert_eq!(out.len(), 2_000_000);
    assert!(out.iter().all(|&b| b == b'x'));
    Ok(())
}

#[test]
fn an_unexpected_signal_death_raises_from_wait() -> anyhow::Result<()> {
    let mut sup = Command::shell("sleep 5").supervise();
    sup.start()?;
    let pid = sup.pid().expect("running child has a pid") as i32;
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        unsafe {
            libc::kill(pid, libc::SIGKILL);
        }
    });
    let err = sup.wait().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Runtime);
    assert!(err.to_string().contains("signaled with signal 9"));
    assert!(sup.is_signaled());
    assert_eq!(sup.exit_code(), Some(137));
    Ok(())
}

#[test]
fn capability_report_renders() {
    let mut res = overseer::CheckResult::new();
    overseer::check(&mut res);
    assert!(!res.has_errors());
    let _ = res.to_string();
    assert!(!overseer::is_windows());
}

#[test]
fn pty_mode_collects_terminal_output() -> anyhow::Result<()> {
    if !overseer::supports_pty() {
        return Ok(());
    }
    let mut cmd = Command::shell("printf hello-from-pty");
    cmd.mode(Mode::Pty);
    let mut sup = cmd.supervise();
    sup.start()?;
    sup.wait()?;
    assert!(sup
        .output_string(Channel::Out)?
        .contains("hello-from-pty"));
    Ok(())
}
