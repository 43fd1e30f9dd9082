use anyhow::{anyhow, bail, Result};
use authpolicy_controller_core::{
    selector::InvalidSelector, Authorize, PipelineState, Selector, Verdict,
};
use regex::Regex;
use serde_json::Value;

/// Authorizes a request by matching rules against the authorization JSON.
#[derive(Clone, Debug)]
pub struct JsonRules {
    rules: Vec<Rule>,
    mode: Mode,
}

#[derive(Clone, Debug)]
pub struct Rule {
    selector: Selector,
    operator: Operator,
    value: String,
}

#[derive(Clone, Debug)]
enum Operator {
    Eq,
    Neq,
    Incl,
    Excl,
    Matches(Regex),
}

/// How rule outcomes combine.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    All,
    Any,
}

#[derive(Debug, thiserror::Error)]
pub enum InvalidRule {
    #[error(transparent)]
    Selector(#[from] InvalidSelector),

    #[error("unknown operator {0:?}")]
    UnknownOperator(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
}

// === impl JsonRules ===

impl JsonRules {
    pub fn new(rules: Vec<Rule>, mode: Mode) -> Self {
        Self { rules, mode }
    }

    fn eval(&self, doc: &Value) -> Result<bool> {
        for rule in &self.rules {
            let matched = rule.eval(doc)?;
            match self.mode {
                Mode::All if !matched => return Ok(false),
                Mode::Any if matched => return Ok(true),
                _ => {}
            }
        }
        // An empty rule set only matches in `all` mode.
        Ok(self.mode == Mode::All)
    }
}

#[async_trait::async_trait]
impl Authorize for JsonRules {
    async fn call(&self, state: &PipelineState) -> Result<Verdict> {
        let doc = state.authorization_json();
        if self.eval(&doc)? {
            return Ok(Verdict::Allow);
        }
        Ok(Verdict::Deny(Some("no matching rules".to_string())))
    }
}

// === impl Rule ===

impl Rule {
    pub fn new(selector: &str, operator: &str, value: impl ToString) -> Result<Self, InvalidRule> {
        let value = value.to_string();
        let operator = match operator {
            "eq" => Operator::Eq,
            "neq" => Operator::Neq,
            "incl" => Operator::Incl,
            "excl" => Operator::Excl,
            "matches" => Operator::Matches(Regex::new(&value)?),
            op => return Err(InvalidRule::UnknownOperator(op.to_string())),
        };
        Ok(Self {
            selector: selector.parse()?,
            operator,
            value,
        })
    }

    fn eval(&self, doc: &Value) -> Result<bool> {
        let resolved = self
            .selector
            .resolve(doc)
            .ok_or_else(|| anyhow!("selector {} did not resolve", self.selector))?;

        let matched = match &self.operator {
            Operator::Eq => as_text(resolved) == self.value,
            Operator::Neq => as_text(resolved) != self.value,
            Operator::Incl => self.includes(resolved)?,
            Operator::Excl => !self.includes(resolved)?,
            Operator::Matches(re) => re.is_match(&as_text(resolved)),
        };
        Ok(matched)
    }

    fn includes(&self, resolved: &Value) -> Result<bool> {
        let Value::Array(items) = resolved else {
            bail!("selector {} is not an array", self.selector);
        };
        Ok(items.iter().any(|item| as_text(item) == self.value))
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        v => v.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authpolicy_controller_core::AuthRequest;

    fn state() -> PipelineState {
        let req = AuthRequest::new("talker-api", "GET", "/hello").with_header("x-tenant", "acme");
        let mut state = PipelineState::new(req);
        state.set_identity(
            "keycloak",
            serde_json::json!({"sub": "ada", "roles": ["viewer", "admin"], "level": 3}),
        );
        state
    }

    fn rule(selector: &str, op: &str, value: &str) -> Rule {
        Rule::new(selector, op, value).unwrap()
    }

    async fn verdict(rules: Vec<Rule>, mode: Mode) -> Result<Verdict> {
        JsonRules::new(rules, mode).call(&state()).await
    }

    #[tokio::test]
    async fn operators() {
        for (r, expected) in [
            (rule("request.method", "eq", "GET"), true),
            (rule("request.method", "neq", "GET"), false),
            (rule("auth.identity.level", "eq", "3"), true),
            (rule("auth.identity.roles", "incl", "admin"), true),
            (rule("auth.identity.roles", "excl", "admin"), false),
            (rule("request.headers.x-tenant", "matches", "^ac"), true),
            (rule("request.path", "matches", "^/admin"), false),
        ] {
            let verdict = verdict(vec![r.clone()], Mode::All).await.unwrap();
            assert_eq!(verdict.is_allow(), expected, "{r:?}");
        }
    }

    #[tokio::test]
    async fn modes() {
        let rules = vec![
            rule("request.method", "eq", "POST"),
            rule("auth.identity.sub", "eq", "ada"),
        ];
        assert!(!verdict(rules.clone(), Mode::All).await.unwrap().is_allow());
        assert!(verdict(rules, Mode::Any).await.unwrap().is_allow());

        assert!(verdict(vec![], Mode::All).await.unwrap().is_allow());
        assert!(!verdict(vec![], Mode::Any).await.unwrap().is_allow());
    }

    #[tokio::test]
    async fn unresolved_selectors_are_errors() {
        let rules = vec![rule("auth.identity.email", "eq", "ada@example.com")];
        assert!(verdict(rules, Mode::All).await.is_err());

        let rules = vec![rule("auth.identity.sub", "incl", "ada")];
        assert!(verdict(rules, Mode::All).await.is_err());
    }

    #[test]
    fn invalid_rules() {
        assert!(matches!(
            Rule::new("request.method", "like", "GET"),
            Err(InvalidRule::UnknownOperator(_))
        ));
        assert!(matches!(
            Rule::new("request..method", "eq", "GET"),
            Err(InvalidRule::Selector(_))
        ));
        assert!(matches!(
            Rule::new("request.path", "matches", "(unclosed"),
            Err(InvalidRule::Pattern(_))
        ));
    }
}
