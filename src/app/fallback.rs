use std::fmt::Display;

use tracing::debug;

type Step<'a, C, T, E> = Box<dyn FnMut(&mut C) -> Result<T, E> + 'a>;

/// Runs named strategies in order against a shared context. Errors accepted by the
/// `recoverable` predicate move on to the next strategy; any other error stops the chain.
pub struct OrderedFallback<'a, C, T, E> {
    chain: &'static str,
    steps: Vec<(&'static str, Step<'a, C, T, E>)>,
}

#[derive(Debug, PartialEq)]
pub struct Resolved<T> {
    pub value: T,
    pub strategy: &'static str,
    /// 1-based position of the winning strategy.
    pub attempt: usize,
}

#[derive(Debug, PartialEq)]
pub enum FallbackError<E> {
    Exhausted {
        chain: &'static str,
        attempts: usize,
        last: Option<E>,
    },
    Aborted {
        chain: &'static str,
        strategy: &'static str,
        error: E,
    },
}

impl<E> FallbackError<E> {
    pub fn last_error(&self) -> Option<&E> {
        match self {
            FallbackError::Exhausted { last, .. } => last.as_ref(),
            FallbackError::Aborted { error, .. } => Some(error),
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            FallbackError::Exhausted { last, .. } => last,
            FallbackError::Aborted { error, .. } => Some(error),
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FallbackError::Exhausted { .. })
    }
}

impl<'a, C, T, E: Display> OrderedFallback<'a, C, T, E> {
    pub fn new(chain: &'static str) -> Self {
        Self {
            chain,
            steps: Vec::new(),
        }
    }

    pub fn then(
        mut self,
        strategy: &'static str,
        step: impl FnMut(&mut C) -> Result<T, E> + 'a,
    ) -> Self {
        self.steps.push((strategy, Box::new(step)));
        self
    }

    pub fn then_if(
        self,
        enabled: bool,
        strategy: &'static str,
        step: impl FnMut(&mut C) -> Result<T, E> + 'a,
    ) -> Self {
        if enabled {
            self.then(strategy, step)
        } else {
            self
        }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run(
        self,
        context: &mut C,
        recoverable: impl Fn(&E) -> bool,
    ) -> Result<Resolved<T>, FallbackError<E>> {
        let chain = self.chain;
        let attempts = self.steps.len();
        let mut last = None;
        for (index, (strategy, mut step)) in self.steps.into_iter().enumerate() {
            match step(context) {
                Ok(value) => {
                    if index > 0 {
                        debug!(chain, strategy, attempt = index + 1, "fallback strategy succeeded");
                    }
                    return Ok(Resolved {
                        value,
                        strategy,
                        attempt: index + 1,
                    });
                }
                Err(error) if recoverable(&error) => {
                    debug!(chain, strategy, error = %error, "strategy failed; trying next");
                    last = Some(error);
                }
                Err(error) => {
                    debug!(chain, strategy, error = %error, "strategy aborted chain");
                    return Err(FallbackError::Aborted {
                        chain,
                        strategy,
                        error,
                    });
                }
            }
        }
        Err(FallbackError::Exhausted {
            chain,
            attempts,
            last,
        })
    }
}
