//! Out-of-process calculation strategy.
//!
//! Every operation starts a fresh child process, writes one JSON request
//! to its stdin and reads one JSON answer from its stdout. Nothing survives
//! between calls, so a misbehaving script cannot poison the next one. A
//! child still running at the deadline is killed.
//!
//! Request: `{"operation": "calculate_mean_rate", "bids": [..], "asks": [..]}`
//! plus `"type"` / `"usdmid"` / `"incoming"` / `"mean"` where relevant.
//! Answer: `{"bid": f, "ask": f}`, `{"value": f}` or `{"result": bool}`.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use ratefeed_common::{now, CalculatedRate, CurrencyPair, MeanRate, RawRate};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::calculator::RateCalculator;
use crate::error::{CalculatorError, CalculatorResult};

/// Default deadline for one calculator invocation.
pub const DEFAULT_PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Runs an external program for each calculation.
#[derive(Debug, Clone)]
pub struct ProcessCalculator {
    program: String,
    args: Vec<String>,
    name: String,
    timeout: Duration,
}

impl ProcessCalculator {
    /// Create a strategy running `program args..`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: format!("process:{program}"),
            program,
            args,
            timeout: DEFAULT_PROCESS_TIMEOUT,
        }
    }

    /// Set how long one invocation may run before it is killed.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn invoke(&self, request: Value) -> CalculatorResult<Value> {
        debug!(strategy = %self.name, operation = %request["operation"], "Invoking calculator");

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CalculatorError::Unavailable {
                strategy: self.name.clone(),
                reason: e.to_string(),
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(request.to_string().as_bytes())
                .map_err(|e| self.failed(format!("writing request: {e}")))?;
            // stdin dropped here so the child sees EOF
        }

        // Drain both pipes while waiting so a chatty child cannot block on a full pipe
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait_until_deadline(&mut child)?;
        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr);
            return Err(self.failed(format!("exited with {status}: {}", stderr.trim())));
        }

        serde_json::from_slice(&stdout)
            .map_err(|e| self.invalid(format!("answer is not JSON: {e}")))
    }

    fn wait_until_deadline(&self, child: &mut Child) -> CalculatorResult<ExitStatus> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => break,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(self.failed(format!("waiting for process: {e}"))),
            }
        }

        let timeout_ms = self.timeout.as_millis() as u64;
        warn!(strategy = %self.name, timeout_ms, "Calculator timed out, killing");
        if let Err(e) = child.kill() {
            debug!(strategy = %self.name, error = %e, "Kill failed");
        }
        // Reap the child so it does not linger as a zombie
        if let Err(e) = child.wait() {
            debug!(strategy = %self.name, error = %e, "Reaping killed process failed");
        }
        Err(CalculatorError::TimedOut {
            strategy: self.name.clone(),
            timeout_ms,
        })
    }

    fn quote_pair(&self, answer: &Value) -> CalculatorResult<(f64, f64)> {
        Ok((self.number(answer, "bid")?, self.number(answer, "ask")?))
    }

    fn number(&self, answer: &Value, field: &str) -> CalculatorResult<f64> {
        answer
            .get(field)
            .and_then(Value::as_f64)
            .ok_or_else(|| self.invalid(format!("missing numeric field {field:?} in {answer}")))
    }

    fn failed(&self, reason: String) -> CalculatorError {
        CalculatorError::StrategyFailed {
            strategy: self.name.clone(),
            reason,
        }
    }

    fn invalid(&self, reason: String) -> CalculatorError {
        CalculatorError::InvalidResponse {
            strategy: self.name.clone(),
            reason,
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            // A read error keeps whatever arrived before it
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

impl RateCalculator for ProcessCalculator {
    fn strategy(&self) -> &str {
        &self.name
    }

    fn calculate_mean_rate(&self, bids: &[f64], asks: &[f64]) -> CalculatorResult<MeanRate> {
        let answer = self.invoke(json!({
            "operation": "calculate_mean_rate",
            "bids": bids,
            "asks": asks,
        }))?;
        let (bid, ask) = self.quote_pair(&answer)?;
        Ok(MeanRate::new(bid, ask))
    }

    fn calculate_for_raw_rate_type(
        &self,
        pair: &CurrencyPair,
        usdmid: f64,
        bids: &[f64],
        asks: &[f64],
    ) -> CalculatorResult<CalculatedRate> {
        let answer = self.invoke(json!({
            "operation": "calculate_for_raw_rate_type",
            "type": pair,
            "usdmid": usdmid,
            "bids": bids,
            "asks": asks,
        }))?;
        let (bid, ask) = self.quote_pair(&answer)?;
        Ok(CalculatedRate::new(pair.calculated_type(), bid, ask, now()))
    }

    fn calculate_for_usd_try(
        &self,
        bids: &[f64],
        asks: &[f64],
    ) -> CalculatorResult<CalculatedRate> {
        let answer = self.invoke(json!({
            "operation": "calculate_for_usd_try",
            "bids": bids,
            "asks": asks,
        }))?;
        let (bid, ask) = self.quote_pair(&answer)?;
        Ok(CalculatedRate::new(CurrencyPair::usd_try(), bid, ask, now()))
    }

    fn has_at_least_one_percent_diff(
        &self,
        incoming: &RawRate,
        mean: &MeanRate,
    ) -> CalculatorResult<bool> {
        let answer = self.invoke(json!({
            "operation": "has_at_least_one_percent_diff",
            "incoming": { "bid": incoming.bid, "ask": incoming.ask },
            "mean": { "bid": mean.mean_bid, "ask": mean.mean_ask },
        }))?;
        answer
            .get("result")
            .and_then(Value::as_bool)
            .ok_or_else(|| self.invalid(format!("missing boolean field \"result\" in {answer}")))
    }

    fn calculate_usdmid(&self, bids: &[f64], asks: &[f64]) -> CalculatorResult<f64> {
        let answer = self.invoke(json!({
            "operation": "calculate_usdmid",
            "bids": bids,
            "asks": asks,
        }))?;
        self.number(&answer, "value")
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn script(body: &str) -> ProcessCalculator {
        ProcessCalculator::new(
            "sh",
            vec!["-c".to_string(), format!("cat > /dev/null; {body}")],
        )
    }

    #[test]
    fn test_reads_quote_answer() {
        let calc = script(r#"echo '{"bid": 1.5, "ask": 2.5}'"#);
        let mean = calc.calculate_mean_rate(&[1.0], &[2.0]).unwrap();
        assert_eq!(mean, MeanRate::new(1.5, 2.5));

        let pair: CurrencyPair = "GBP_USD".parse().unwrap();
        let derived = calc
            .calculate_for_raw_rate_type(&pair, 34.0, &[1.0], &[2.0])
            .unwrap();
        assert_eq!(derived.pair.to_string(), "GBP_TRY");
    }

    #[test]
    fn test_reads_scalar_and_boolean_answers() {
        let usdmid = script(r#"echo '{"value": 35.5}'"#);
        assert_eq!(usdmid.calculate_usdmid(&[35.0], &[36.0]).unwrap(), 35.5);

        let diff = script(r#"echo '{"result": true}'"#);
        let rate = RawRate::new(
            CurrencyPair::usd_try(),
            "PF1".into(),
            35.0,
            36.0,
            now(),
        );
        assert!(diff
            .has_at_least_one_percent_diff(&rate, &MeanRate::new(1.0, 1.0))
            .unwrap());
    }

    #[test]
    fn test_wrong_shape_is_invalid_response() {
        let calc = script(r#"echo '{"mid": 1.0}'"#);
        let err = calc.calculate_mean_rate(&[1.0], &[2.0]).unwrap_err();
        assert!(matches!(err, CalculatorError::InvalidResponse { .. }));

        let garbage = script("echo not-json");
        assert!(matches!(
            garbage.calculate_usdmid(&[1.0], &[2.0]),
            Err(CalculatorError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_failing_script_is_strategy_failure() {
        let calc = script("echo boom >&2; exit 3");
        let err = calc.calculate_usdmid(&[1.0], &[2.0]).unwrap_err();
        match err {
            CalculatorError::StrategyFailed { strategy, reason } => {
                assert_eq!(strategy, "process:sh");
                assert!(reason.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_hung_script_is_killed_at_deadline() {
        let calc = ProcessCalculator::new("sh", vec!["-c".to_string(), "exec sleep 30".to_string()])
            .with_timeout(Duration::from_millis(100));

        let started = Instant::now();
        let err = calc.calculate_usdmid(&[1.0], &[2.0]).unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(10));
        match err {
            CalculatorError::TimedOut { strategy, timeout_ms } => {
                assert_eq!(strategy, "process:sh");
                assert_eq!(timeout_ms, 100);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_program_is_unavailable() {
        let calc = ProcessCalculator::new("/nonexistent/ratefeed-calculator", vec![]);
        assert!(matches!(
            calc.calculate_usdmid(&[1.0], &[2.0]),
            Err(CalculatorError::Unavailable { .. })
        ));
    }
}
