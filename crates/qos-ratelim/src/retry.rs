//! A small combinator for retrying an operation a fixed number of times.

use tracing::trace;

use crate::err::RetryError;

/// How many attempts we make by default.
///
/// A reservation only fails when the limit changes between reading it and
/// asking the bucket for tokens; three tries are plenty for that.
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// A policy for retrying an operation: attempt, recompute, retry or fail.
///
/// The operation is handed the index of the current attempt, and is expected
/// to recompute its inputs (for example, re-read the current limit) on every
/// call.  There is no delay between attempts.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BoundedRetry {
    /// The maximum number of attempts.  Always at least one.
    attempts: u32,
}

impl BoundedRetry {
    /// Return a policy that makes at most `attempts` attempts.
    ///
    /// A value of zero is treated as one.
    pub fn new(attempts: u32) -> Self {
        BoundedRetry {
            attempts: attempts.max(1),
        }
    }

    /// Return the maximum number of attempts for this policy.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Run `op` until it succeeds or until we run out of attempts.
    ///
    /// On failure, returns the error from the final attempt.
    pub fn run<T, E, F>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Result<T, E>,
    {
        let mut attempt = 0;
        loop {
            match op(attempt) {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.attempts {
                        return Err(RetryError::new(attempt, e));
                    }
                    trace!(attempt, "attempt failed; retrying");
                }
            }
        }
    }
}

impl Default for BoundedRetry {
    fn default() -> Self {
        BoundedRetry::new(DEFAULT_ATTEMPTS)
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn gives_up() {
        let mut calls = Vec::new();
        let err = BoundedRetry::default()
            .run(|attempt| -> Result<(), String> {
                calls.push(attempt);
                Err(format!("failure {attempt}"))
            })
            .unwrap_err();
        assert_eq!(calls, vec![0, 1, 2]);
        assert_eq!(err.attempts(), 3);
        assert_eq!(err.last(), "failure 2");
    }

    #[test]
    fn recomputes_until_success() {
        // Pretend the limit shrinks under us, then settles.
        let limits = [100_u64, 50, 20];
        let burst = 20;
        let got = BoundedRetry::default()
            .run(|attempt| {
                let want = limits[attempt as usize];
                if want <= burst {
                    Ok(want)
                } else {
                    Err(want)
                }
            })
            .unwrap();
        assert_eq!(got, 20);
    }

    #[test]
    fn at_least_once() {
        let p = BoundedRetry::new(0);
        assert_eq!(p.attempts(), 1);
        let mut n = 0;
        let _ = p.run(|_| -> Result<(), ()> {
            n += 1;
            Err(())
        });
        assert_eq!(n, 1);

        assert_eq!(BoundedRetry::new(1).run(|a| Ok::<_, ()>(a)).unwrap(), 0);
    }
}
