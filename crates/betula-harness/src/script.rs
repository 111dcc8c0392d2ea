//! Test-script parsing.
//!
//! One operation per line:
//!
//! ```text
//! Inserting N
//! Updating N
//! Deleting N
//! Query N -> V        (V is the expected value, or DNE)
//! Full_scan 0
//! Lower_bound_scan N
//! Upper_bound_scan N
//! ```

/// Expected outcome of a scripted query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expected {
    Value(String),
    Missing,
}

/// A single scripted operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptOp {
    Insert(u64),
    Update(u64),
    Delete(u64),
    /// Query with an optional expectation; randomly generated queries
    /// carry none.
    Query(u64, Option<Expected>),
    FullScan,
    LowerBoundScan(u64),
    UpperBoundScan(u64),
}

fn parse_key(token: Option<&str>) -> Result<u64, String> {
    let token = token.ok_or("missing operand")?;
    token
        .parse::<u64>()
        .map_err(|_| format!("invalid operand: {token}"))
}

/// Parses one script line.
pub fn parse_line(line: &str) -> Result<ScriptOp, String> {
    let mut tokens = line.split_whitespace();
    let command = tokens.next().ok_or("empty line")?;
    let op = match command {
        "Inserting" => ScriptOp::Insert(parse_key(tokens.next())?),
        "Updating" => ScriptOp::Update(parse_key(tokens.next())?),
        "Deleting" => ScriptOp::Delete(parse_key(tokens.next())?),
        "Query" => {
            let key = parse_key(tokens.next())?;
            match tokens.next() {
                Some("->") => {}
                other => return Err(format!("expected \"->\", found {other:?}")),
            }
            let value = tokens.next().ok_or("missing expected value")?;
            let expected = if value == "DNE" {
                Expected::Missing
            } else {
                Expected::Value(value.to_string())
            };
            ScriptOp::Query(key, Some(expected))
        }
        "Full_scan" => {
            parse_key(tokens.next())?;
            ScriptOp::FullScan
        }
        "Lower_bound_scan" => ScriptOp::LowerBoundScan(parse_key(tokens.next())?),
        "Upper_bound_scan" => ScriptOp::UpperBoundScan(parse_key(tokens.next())?),
        unknown => return Err(format!("unknown command: {unknown}")),
    };
    if let Some(extra) = tokens.next() {
        return Err(format!("trailing token: {extra}"));
    }
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mutations() {
        assert_eq!(parse_line("Inserting 12").unwrap(), ScriptOp::Insert(12));
        assert_eq!(parse_line("Updating 7").unwrap(), ScriptOp::Update(7));
        assert_eq!(parse_line("Deleting 0").unwrap(), ScriptOp::Delete(0));
    }

    #[test]
    fn test_parse_query_with_value() {
        assert_eq!(
            parse_line("Query 5 -> 5:").unwrap(),
            ScriptOp::Query(5, Some(Expected::Value("5:".to_string())))
        );
    }

    #[test]
    fn test_parse_query_missing() {
        assert_eq!(
            parse_line("Query 5 -> DNE").unwrap(),
            ScriptOp::Query(5, Some(Expected::Missing))
        );
    }

    #[test]
    fn test_parse_scans() {
        assert_eq!(parse_line("Full_scan 0").unwrap(), ScriptOp::FullScan);
        assert_eq!(
            parse_line("Lower_bound_scan 42").unwrap(),
            ScriptOp::LowerBoundScan(42)
        );
        assert_eq!(
            parse_line("Upper_bound_scan 42").unwrap(),
            ScriptOp::UpperBoundScan(42)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_line("Frobnicating 12").is_err());
        assert!(parse_line("Inserting").is_err());
        assert!(parse_line("Inserting twelve").is_err());
        assert!(parse_line("Query 5 DNE").is_err());
        assert!(parse_line("Inserting 12 13").is_err());
    }
}
