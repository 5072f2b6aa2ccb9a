//! Invocations served by the demo host.

use interrupt_rpc::{ApplicationError, CancellationToken, Invocation, InvocationRegistry};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

/// Server-side context: a fixed base value.
#[derive(Debug, Clone, Copy)]
pub struct Calculator {
    pub base: i64,
}

/// Add `number` to the host's base.
#[derive(Debug, Serialize, Deserialize)]
pub struct Add {
    pub number: i64,
}

#[async_trait::async_trait]
impl Invocation for Add {
    const METHOD: &'static str = "add";
    type Context = Calculator;
    type Output = i64;

    async fn execute(
        &self,
        calc: &Calculator,
        _cancel: &CancellationToken,
    ) -> Result<i64, ApplicationError> {
        calc.base.checked_add(self.number).ok_or_else(|| {
            ApplicationError::new(
                "overflow",
                format!("{} + {} does not fit in i64", calc.base, self.number),
            )
        })
    }
}

/// Sleep on the host, returning how long it actually slept in milliseconds.
#[derive(Debug, Serialize, Deserialize)]
pub struct Sleep {
    pub millis: u64,
}

#[async_trait::async_trait]
impl Invocation for Sleep {
    const METHOD: &'static str = "sleep";
    type Context = Calculator;
    type Output = u64;

    async fn execute(
        &self,
        _calc: &Calculator,
        cancel: &CancellationToken,
    ) -> Result<u64, ApplicationError> {
        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(self.millis)) => {
                Ok(started.elapsed().as_millis() as u64)
            }
            _ = cancel.cancelled() => {
                debug!("Sleep cancelled after {:?}", started.elapsed());
                Err(ApplicationError::interrupted(format!(
                    "sleep cancelled after {} ms",
                    started.elapsed().as_millis()
                )))
            }
        }
    }
}

pub fn registry() -> InvocationRegistry<Calculator> {
    InvocationRegistry::new().register::<Add>().register::<Sleep>()
}
