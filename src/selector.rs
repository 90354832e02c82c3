use crate::errors::*;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use std::collections::BTreeMap;

enum Requirement<'a> {
    Equals(&'a str, &'a str),
    In(&'a str, &'a [String]),
    NotIn(&'a str, &'a [String]),
    Exists(&'a str),
    DoesNotExist(&'a str),
}

fn requirements(selector: &LabelSelector) -> Result<Vec<Requirement<'_>>> {
    let mut reqs = Vec::new();
    if let Some(labels) = &selector.match_labels {
        reqs.extend(labels.iter().map(|(k, v)| Requirement::Equals(k, v)));
    }
    for expr in selector.match_expressions.iter().flatten() {
        reqs.push(requirement(expr)?);
    }
    if reqs.is_empty() {
        bail!(ErrorKind::InvalidSelector("empty selector would select everything".into()));
    }
    Ok(reqs)
}

fn requirement(expr: &LabelSelectorRequirement) -> Result<Requirement<'_>> {
    let values = expr.values.as_deref().unwrap_or(&[]);
    let key = expr.key.as_str();
    match expr.operator.as_str() {
        "In" | "NotIn" if values.is_empty() => bail!(ErrorKind::InvalidSelector(format!(
            "{} on {} needs at least one value",
            expr.operator, key
        ))),
        "Exists" | "DoesNotExist" if !values.is_empty() => bail!(ErrorKind::InvalidSelector(
            format!("{} on {} takes no values", expr.operator, key)
        )),
        "In" => Ok(Requirement::In(key, values)),
        "NotIn" => Ok(Requirement::NotIn(key, values)),
        "Exists" => Ok(Requirement::Exists(key)),
        "DoesNotExist" => Ok(Requirement::DoesNotExist(key)),
        other => bail!(ErrorKind::InvalidSelector(format!("unknown operator {}", other))),
    }
}

/// Renders the selector in the string form the API server accepts.
pub fn to_query(selector: &LabelSelector) -> Result<String> {
    let parts: Vec<String> = requirements(selector)?
        .into_iter()
        .map(|r| match r {
            Requirement::Equals(k, v) => format!("{}={}", k, v),
            Requirement::In(k, vs) => format!("{} in ({})", k, vs.join(",")),
            Requirement::NotIn(k, vs) => format!("{} notin ({})", k, vs.join(",")),
            Requirement::Exists(k) => k.to_string(),
            Requirement::DoesNotExist(k) => format!("!{}", k),
        })
        .collect();
    Ok(parts.join(","))
}

pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> Result<bool> {
    Ok(requirements(selector)?.into_iter().all(|r| match r {
        Requirement::Equals(k, v) => labels.get(k).map_or(false, |l| l == v),
        Requirement::In(k, vs) => labels.get(k).map_or(false, |l| vs.contains(l)),
        Requirement::NotIn(k, vs) => labels.get(k).map_or(true, |l| !vs.contains(l)),
        Requirement::Exists(k) => labels.contains_key(k),
        Requirement::DoesNotExist(k) => !labels.contains_key(k),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.into(),
            operator: op.into(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn renders_and_matches_expressions() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "web")])),
            match_expressions: Some(vec![
                expr("tier", "In", &["a", "b"]),
                expr("legacy", "DoesNotExist", &[]),
            ]),
        };
        assert_eq!(to_query(&selector).unwrap(), "app=web,tier in (a,b),!legacy");
        assert!(matches(&selector, &labels(&[("app", "web"), ("tier", "b")])).unwrap());
        assert!(!matches(&selector, &labels(&[("app", "web"), ("tier", "c")])).unwrap());
        let legacy = labels(&[("app", "web"), ("tier", "a"), ("legacy", "")]);
        assert!(!matches(&selector, &legacy).unwrap());
    }

    #[test]
    fn malformed_selectors_are_rejected() {
        assert!(to_query(&LabelSelector::default()).is_err());

        let bad_op = LabelSelector {
            match_expressions: Some(vec![expr("tier", "Near", &["a"])]),
            ..LabelSelector::default()
        };
        let err = to_query(&bad_op).unwrap_err();
        assert!(err.is_permanent());

        let missing_values = LabelSelector {
            match_expressions: Some(vec![expr("tier", "In", &[])]),
            ..LabelSelector::default()
        };
        assert!(matches(&missing_values, &BTreeMap::new()).is_err());
    }
}
