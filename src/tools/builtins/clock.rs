//! `Builtins.Clock`: current time and date.

use chrono::{FixedOffset, Utc};
use schemars::JsonSchema;
use serde::Deserialize;

use crate::functions::{typed, NoArgs, ToolType};

#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NowArgs {
    /// Offset from UTC in minutes; UTC when omitted.
    #[serde(default)]
    pub utc_offset_minutes: Option<i32>,
}

pub fn tool_type() -> ToolType {
    ToolType::new(super::NAMESPACE, "Clock")
        .with_static(
            "Now",
            typed(|args: NowArgs| async move { now(args) })
                .with_description("Current date and time as an RFC 3339 timestamp"),
        )
        .with_static(
            "Today",
            typed(|_: NoArgs| async { Ok(Utc::now().date_naive().to_string()) })
                .with_description("Current UTC date (YYYY-MM-DD)"),
        )
}

fn now(args: NowArgs) -> anyhow::Result<String> {
    let utc = Utc::now();
    match args.utc_offset_minutes {
        None | Some(0) => Ok(utc.to_rfc3339()),
        Some(minutes) => {
            let offset = minutes
                .checked_mul(60)
                .and_then(FixedOffset::east_opt)
                .ok_or_else(|| anyhow::anyhow!("utc_offset_minutes {minutes} is out of range"))?;
            Ok(utc.with_timezone(&offset).to_rfc3339())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::functions::FunctionRegistry;
    use serde_json::json;

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        crate::tools::builtins::register(&mut registry);
        registry
    }

    #[tokio::test]
    async fn now_is_rfc3339_and_honours_offset() {
        let f = registry().resolve("Builtins.Clock.Now").unwrap();
        let out = f.callable.call(json!({})).await.unwrap();
        let text = out.as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(text).is_ok());

        let out = f
            .callable
            .call(json!({ "utc_offset_minutes": 120 }))
            .await
            .unwrap();
        assert!(out.as_str().unwrap().ends_with("+02:00"));

        assert!(f
            .callable
            .call(json!({ "utc_offset_minutes": 100000 }))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn today_is_a_plain_date() {
        let f = registry().resolve("Builtins.Clock.Today").unwrap();
        let out = f.callable.call(json!({})).await.unwrap();
        assert!(chrono::NaiveDate::parse_from_str(out.as_str().unwrap(), "%Y-%m-%d").is_ok());
    }
}
