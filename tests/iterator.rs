//! Iterator facade scenarios: channel filtering, non-blocking pulls,
//! re-iteration over buffered history.
#![cfg(unix)]

use overseer::{Channel, Command, IterFlags};

const ALTERNATING: &str =
    "printf txt; printf err >&2; sleep 0.1; printf txt2; printf err2 >&2";

fn collect(
    chunks: overseer::Chunks<'_>,
) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let mut err = Vec::new();
    for item in chunks {
        let (channel, data) = item?;
        match channel {
            Channel::Out => out.extend(data),
            Channel::Err => err.extend(data),
        }
    }
    Ok((out, err))
}

#[test]
fn unfiltered_iteration_sees_both_channels() -> anyhow::Result<()> {
    let mut sup = Command::shell(ALTERNATING).supervise();
    // no explicit start: the first pull starts a Ready child
    let (out, err) = collect(sup.chunks())?;
    assert_eq!(out, b"txttxt2");
    assert_eq!(err, b"errerr2");
    // iteration equivalence: the same bytes are in the buffers
    assert_eq!(sup.output(Channel::Out)?, out);
    assert_eq!(sup.output(Channel::Err)?, err);
    Ok(())
}

#[test]
fn skip_err_iterates_stdout_only() -> anyhow::Result<()> {
    let mut sup = Command::shell(ALTERNATING).supervise();
    let flags = IterFlags {
        skip_err: true,
        ..Default::default()
    };
    let (out, err) = collect(sup.chunks_with(flags))?;
    assert_eq!(out, b"txttxt2");
    assert!(err.is_empty());
    // the temporary flags were restored when the adapter dropped
    assert_eq!(sup.iter_flags(), IterFlags::default());
    Ok(())
}

#[test]
fn skip_out_iterates_stderr_only() -> anyhow::Result<()> {
    let mut sup = Command::shell(ALTERNATING).supervise();
    let flags = IterFlags {
        skip_out: true,
        ..Default::default()
    };
    let (out, err) = collect(sup.chunks_with(flags))?;
    assert!(out.is_empty());
    assert_eq!(err, b"errerr2");
    Ok(())
}

#[test]
fn non_blocking_iteration_yields_empty_chunks_while_waiting() -> anyhow::Result<()> {
    let mut sup = Command::shell("sleep 0.2; printf late").supervise();
    let flags = IterFlags {
        non_blocking: true,
        ..Default::default()
    };
    let mut out = Vec::new();
    let mut saw_empty = false;
    for item in sup.chunks_with(flags) {
        let (channel, data) = item?;
        if data.is_empty() {
            saw_empty = true;
            std::thread::sleep(std::time::Duration::from_millis(10));
            continue;
        }
        assert_eq!(channel, Channel::Out);
        out.extend(data);
    }
    assert!(saw_empty, "expected control to come back before data");
    assert_eq!(out, b"late");
    Ok(())
}

#[test]
fn rewinding_re_reads_buffered_history() -> anyhow::Result<()> {
    let mut sup = Command::shell("printf once").supervise();
    let (out, _) = collect(sup.chunks())?;
    assert_eq!(out, b"once");
    // the child is not restarted; the same history replays
    let (again, _) = collect(sup.chunks())?;
    assert_eq!(again, b"once");
    Ok(())
}
