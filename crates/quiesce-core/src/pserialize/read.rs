//! Read-side gate

use crate::spl::{self, Ipl, SplToken};

/// Level readers run at: soft interrupts, and with them preemption, are
/// held off on this CPU for the duration of the read.
const READ_IPL: Ipl = Ipl::SoftSerial;

/// Saved priority level of an open read section
#[derive(Debug)]
#[must_use = "a read section must be closed with read_exit"]
pub struct ReadToken(SplToken);

/// Open a read section on the current CPU
///
/// Takes no lock and touches no shared memory. The caller must occupy a
/// CPU for the section to hold off grace periods.
#[inline]
pub fn read_enter() -> ReadToken {
    ReadToken(spl::raise(READ_IPL))
}

/// Close the read section opened by `read_enter`
#[inline]
pub fn read_exit(token: ReadToken) {
    spl::restore(token.0);
}

/// True while the current thread is inside a read section
#[inline]
pub(crate) fn in_read_section() -> bool {
    spl::current() >= READ_IPL
}

/// Scoped read section, closed on drop
#[derive(Debug)]
pub struct ReadGuard {
    token: Option<ReadToken>,
}

/// Open a read section that closes when the guard drops
#[inline]
pub fn read_section() -> ReadGuard {
    ReadGuard {
        token: Some(read_enter()),
    }
}

impl Drop for ReadGuard {
    #[inline]
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            read_exit(token);
        }
    }
}
