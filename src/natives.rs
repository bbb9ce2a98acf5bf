use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

use crate::value::Value;

/// Seconds elapsed since the Unix epoch, as a float. The one native the
/// reference implementation wires up, useful for timing a benchmark
/// loop from inside the language.
pub fn clock(args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("Expected 0 arguments but got {}.", args.len()));
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|_| "System clock is before the Unix epoch.".to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}

/// A uniform random float in `[0, 1)`.
pub fn random(args: &[Value]) -> Result<Value, String> {
    if !args.is_empty() {
        return Err(format!("Expected 0 arguments but got {}.", args.len()));
    }
    Ok(Value::Number(rand::thread_rng().gen::<f64>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_rejects_arguments() {
        assert!(clock(&[Value::Nil]).is_err());
    }

    #[test]
    fn clock_returns_a_positive_number() {
        match clock(&[]).unwrap() {
            Value::Number(n) => assert!(n > 0.0),
            _ => panic!("expected a number"),
        }
    }

    #[test]
    fn random_is_within_unit_range() {
        match random(&[]).unwrap() {
            Value::Number(n) => assert!((0.0..1.0).contains(&n)),
            _ => panic!("expected a number"),
        }
    }
}
