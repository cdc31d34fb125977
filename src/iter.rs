use crate::{error::Result, Channel, Supervisor};
use std::collections::VecDeque;

/// Behavior switches for the chunk iteration.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct IterFlags {
    /// Yield a synthetic empty stdout chunk instead of blocking when
    /// no data has arrived yet.
    pub non_blocking: bool,
    pub skip_out: bool,
    pub skip_err: bool,
}

/// Per-supervisor iteration state: active flags, the save stack used
/// by nested iterations, and chunks read but not yet consumed.
pub(crate) struct IterState {
    pub flags: IterFlags,
    pub saved: Vec<IterFlags>,
    pub cache: VecDeque<(Channel, Vec<u8>)>,
}

impl IterState {
    pub fn new() -> Self {
        IterState {
            flags: IterFlags::default(),
            saved: Vec::new(),
            cache: VecDeque::new(),
        }
    }
}

/// Pull-based view of a live child as `(channel, chunk)` pairs.
///
/// Obtained from [`Supervisor::chunks`] or
/// [`Supervisor::chunks_with`]; the first pull starts a `Ready` child
/// automatically. Dropping the adapter restores any flags it
/// installed.
pub struct Chunks<'a> {
    pub(crate) sup: &'a mut Supervisor,
    pub(crate) restore: bool,
    pub(crate) done: bool,
}

impl Iterator for Chunks<'_> {
    type Item = Result<(Channel, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.sup.iter_valid() {
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Ok(true) => match self.sup.iter_take() {
                Some(item) => Some(Ok(item)),
                None => {
                    self.done = true;
                    None
                }
            },
        }
    }
}

impl Drop for Chunks<'_> {
    fn drop(&mut self) {
        if self.restore {
            self.sup.restore_iter_flags();
        }
    }
}
