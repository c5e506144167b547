use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    String,
    Long,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// The closed set of query AST nodes (spec §4.F). Constructors enforce the
/// normalization laws so malformed trees can't be built in the first
/// place — callers never see an un-normalized `Boolean`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Ast {
    MatchAll,
    Term { field: String, value: String },
    Wildcard { field: String, pattern: String },
    Fts { field: String, text: String },
    Exists { field: String },
    Missing { field: String },
    Range {
        field: String,
        lo: Option<String>,
        hi: Option<String>,
        include_lo: bool,
        include_hi: bool,
        value_type: ValueType,
    },
    Boolean {
        must: Vec<Ast>,
        should: Vec<Ast>,
        must_not: Vec<Ast>,
        filter: Vec<Ast>,
    },
}

impl Ast {
    pub fn term(field: impl Into<String>, value: impl Into<String>) -> Ast {
        Ast::Term { field: field.into(), value: value.into() }
    }

    pub fn prefix(field: impl Into<String>, value: impl Into<String>) -> Ast {
        Ast::Wildcard {
            field: field.into(),
            pattern: format!("{}*", value.into()),
        }
    }

    pub fn wildcard(field: impl Into<String>, pattern: impl Into<String>) -> Ast {
        Ast::Wildcard { field: field.into(), pattern: pattern.into() }
    }

    pub fn fts(field: impl Into<String>, text: impl Into<String>) -> Ast {
        Ast::Fts { field: field.into(), text: text.into() }
    }

    pub fn exists(field: impl Into<String>) -> Ast {
        Ast::Exists { field: field.into() }
    }

    pub fn missing(field: impl Into<String>) -> Ast {
        Ast::Missing { field: field.into() }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn range(
        field: impl Into<String>,
        lo: Option<String>,
        hi: Option<String>,
        include_lo: bool,
        include_hi: bool,
        value_type: ValueType,
    ) -> Ast {
        Ast::Range { field: field.into(), lo, hi, include_lo, include_hi, value_type }
    }

    /// Build a `boolean` node and immediately apply the normalization laws.
    pub fn boolean(must: Vec<Ast>, should: Vec<Ast>, must_not: Vec<Ast>, filter: Vec<Ast>) -> Ast {
        Ast::Boolean { must, should, must_not, filter }.normalize()
    }

    /// `and(x, y, ...)` is sugar for `boolean{must: [x, y, ...]}`.
    pub fn and(clauses: Vec<Ast>) -> Ast {
        Ast::boolean(clauses, vec![], vec![], vec![])
    }

    /// `or(x, y, ...)` is sugar for `boolean{should: [x, y, ...]}`.
    pub fn or(clauses: Vec<Ast>) -> Ast {
        Ast::boolean(vec![], clauses, vec![], vec![])
    }

    /// `not(x)` is sugar for `boolean{must_not: [x]}`; `not(None)` yields
    /// `must_not(match_all)` per the normalization laws.
    pub fn not(clause: Option<Ast>) -> Ast {
        match clause {
            Some(c) => Ast::boolean(vec![], vec![], vec![c], vec![]),
            None => Ast::boolean(vec![], vec![], vec![Ast::MatchAll], vec![]),
        }
    }

    /// Apply the authoritative normalization laws (spec §4.F):
    /// - empty boolean ⇒ match_all
    /// - single-element should ⇒ unwrap
    /// - must_not-only ⇒ must_all implicit (kept explicit as an empty
    ///   `must` list; evaluator treats empty `must` + nonempty `must_not`
    ///   as "match everything not excluded")
    /// - and(x) ⇒ x; or(x) ⇒ x
    /// Idempotent: `normalize(normalize(x)) == normalize(x)`.
    pub fn normalize(self) -> Ast {
        match self {
            Ast::Boolean { must, should, must_not, filter } => {
                let must: Vec<Ast> = must.into_iter().map(Ast::normalize).collect();
                let should: Vec<Ast> = should.into_iter().map(Ast::normalize).collect();
                let must_not: Vec<Ast> = must_not.into_iter().map(Ast::normalize).collect();
                let filter: Vec<Ast> = filter.into_iter().map(Ast::normalize).collect();

                if must.is_empty() && should.is_empty() && must_not.is_empty() && filter.is_empty()
                {
                    return Ast::MatchAll;
                }

                // and(x) ⇒ x ; or(x) ⇒ x : a single-clause must-only or
                // should-only boolean with nothing else unwraps to the
                // clause itself.
                if must.len() == 1 && should.is_empty() && must_not.is_empty() && filter.is_empty()
                {
                    return must.into_iter().next().unwrap();
                }
                if should.len() == 1 && must.is_empty() && must_not.is_empty() && filter.is_empty()
                {
                    return should.into_iter().next().unwrap();
                }

                Ast::Boolean { must, should, must_not, filter }
            }
            other => other,
        }
    }

    /// Whether this boolean node's `should` clauses require at least one
    /// match: true whenever `should` is non-empty and `must` is empty
    /// (spec: "should without must implies min_should_match=1").
    pub fn should_requires_match(&self) -> bool {
        match self {
            Ast::Boolean { must, should, .. } => !should.is_empty() && must.is_empty(),
            _ => false,
        }
    }
}

/// Top-level query envelope (spec §4.F).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub clause: Ast,
    pub sort: Vec<(String, SortDirection, ValueType)>,
    pub limit: Option<usize>,
    pub offset: usize,
    pub branch: String,
    pub hints: QueryHints,
    pub after: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryHints {
    pub allow_warming: bool,
}

impl Query {
    pub fn new(branch: impl Into<String>, clause: Ast) -> Self {
        Self {
            clause: clause.normalize(),
            sort: Vec::new(),
            limit: None,
            offset: 0,
            branch: branch.into(),
            hints: QueryHints::default(),
            after: None,
        }
    }
}

/// Translates a single SQL condition into an AST clause (spec §4.F). Full
/// statements are the external SQL adapter's job; this pure function is
/// the part that lives in the core because it has no protocol dependency.
pub fn sql_condition_to_ast(field: &str, op: &str, operand: &str) -> Ast {
    match op.to_uppercase().as_str() {
        "=" => Ast::term(field, operand),
        "!=" | "<>" => Ast::not(Some(Ast::term(field, operand))),
        ">" | ">=" | "<" | "<=" => sql_comparison_to_range(field, op, operand),
        "LIKE" => Ast::wildcard(field, operand.replace('%', "*")),
        "IS NULL" => Ast::missing(field),
        "IS NOT NULL" => Ast::exists(field),
        "IN" => {
            let values: Vec<Ast> = split_in_list(operand)
                .into_iter()
                .map(|v| Ast::term(field, v))
                .collect();
            Ast::or(values)
        }
        "NOT IN" => {
            let values: Vec<Ast> = split_in_list(operand)
                .into_iter()
                .map(|v| Ast::term(field, v))
                .collect();
            Ast::boolean(vec![], vec![], values, vec![])
        }
        "BETWEEN" => {
            let (lo, hi) = operand.split_once(" AND ").unwrap_or((operand, operand));
            let value_type = infer_value_type(lo);
            Ast::range(field, Some(lo.trim().into()), Some(hi.trim().into()), true, true, value_type)
        }
        _ => Ast::MatchAll,
    }
}

fn sql_comparison_to_range(field: &str, op: &str, operand: &str) -> Ast {
    let value_type = infer_value_type(operand);
    match op {
        ">" => Ast::range(field, Some(operand.into()), None, false, false, value_type),
        ">=" => Ast::range(field, Some(operand.into()), None, true, false, value_type),
        "<" => Ast::range(field, None, Some(operand.into()), false, false, value_type),
        "<=" => Ast::range(field, None, Some(operand.into()), false, true, value_type),
        _ => Ast::MatchAll,
    }
}

fn infer_value_type(operand: &str) -> ValueType {
    if operand.parse::<i64>().is_ok() {
        ValueType::Long
    } else if operand.parse::<f64>().is_ok() {
        ValueType::Double
    } else {
        ValueType::String
    }
}

fn split_in_list(operand: &str) -> Vec<String> {
    operand
        .trim_matches(|c| c == '(' || c == ')')
        .split(',')
        .map(|s| s.trim().trim_matches('\'').trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Multiple SQL conditions AND together (spec §4.F).
pub fn sql_conditions_to_ast(conditions: &[Ast]) -> Ast {
    Ast::and(conditions.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_boolean_is_match_all() {
        let ast = Ast::boolean(vec![], vec![], vec![], vec![]);
        assert_eq!(ast, Ast::MatchAll);
    }

    #[test]
    fn single_should_unwraps() {
        let ast = Ast::or(vec![Ast::term("city", "Zurich")]);
        assert_eq!(ast, Ast::term("city", "Zurich"));
    }

    #[test]
    fn single_must_and_of_one_unwraps() {
        let ast = Ast::and(vec![Ast::term("city", "Zurich")]);
        assert_eq!(ast, Ast::term("city", "Zurich"));
    }

    #[test]
    fn must_not_only_keeps_must_empty() {
        let ast = Ast::not(Some(Ast::term("city", "Zurich")));
        match &ast {
            Ast::Boolean { must, must_not, .. } => {
                assert!(must.is_empty());
                assert_eq!(must_not.len(), 1);
            }
            _ => panic!("expected boolean"),
        }
    }

    #[test]
    fn not_none_is_must_not_match_all() {
        let ast = Ast::not(None);
        match ast {
            Ast::Boolean { must_not, .. } => assert_eq!(must_not, vec![Ast::MatchAll]),
            _ => panic!("expected boolean"),
        }
    }

    #[test]
    fn normalization_is_idempotent() {
        let ast = Ast::boolean(
            vec![Ast::term("a", "1")],
            vec![Ast::term("b", "2"), Ast::term("c", "3")],
            vec![],
            vec![],
        );
        let once = ast.clone().normalize();
        let twice = once.clone().normalize();
        assert_eq!(once, twice);
    }

    #[test]
    fn prefix_desugars_to_wildcard() {
        let ast = Ast::prefix("name", "Al");
        assert_eq!(ast, Ast::wildcard("name", "Al*"));
    }

    #[test]
    fn sql_equality_to_term() {
        assert_eq!(sql_condition_to_ast("city", "=", "Zurich"), Ast::term("city", "Zurich"));
    }

    #[test]
    fn sql_not_equal_to_not_term() {
        let ast = sql_condition_to_ast("city", "!=", "Zurich");
        match ast {
            Ast::Boolean { must_not, .. } => assert_eq!(must_not, vec![Ast::term("city", "Zurich")]),
            _ => panic!("expected boolean"),
        }
    }

    #[test]
    fn sql_like_converts_percent_to_glob() {
        assert_eq!(
            sql_condition_to_ast("name", "LIKE", "Al%"),
            Ast::wildcard("name", "Al*")
        );
    }

    #[test]
    fn sql_is_null_and_is_not_null() {
        assert_eq!(sql_condition_to_ast("email", "IS NULL", ""), Ast::missing("email"));
        assert_eq!(sql_condition_to_ast("email", "IS NOT NULL", ""), Ast::exists("email"));
    }

    #[test]
    fn sql_in_list_becomes_should() {
        let ast = sql_condition_to_ast("city", "IN", "('Zurich', 'Bern')");
        match ast {
            Ast::Boolean { should, .. } => assert_eq!(should.len(), 2),
            _ => panic!("expected boolean"),
        }
    }

    #[test]
    fn sql_between_is_inclusive_range() {
        let ast = sql_condition_to_ast("age", "BETWEEN", "18 AND 65");
        match ast {
            Ast::Range { lo, hi, include_lo, include_hi, value_type, .. } => {
                assert_eq!(lo, Some("18".to_string()));
                assert_eq!(hi, Some("65".to_string()));
                assert!(include_lo && include_hi);
                assert_eq!(value_type, ValueType::Long);
            }
            _ => panic!("expected range"),
        }
    }

    #[test]
    fn sql_numeric_comparison_types_are_typed() {
        let ast = sql_condition_to_ast("age", ">", "21");
        match ast {
            Ast::Range { value_type, include_lo, .. } => {
                assert_eq!(value_type, ValueType::Long);
                assert!(!include_lo);
            }
            _ => panic!("expected range"),
        }
    }

    #[test]
    fn multiple_conditions_and_together() {
        let conditions = vec![Ast::term("a", "1"), Ast::term("b", "2")];
        let ast = sql_conditions_to_ast(&conditions);
        match ast {
            Ast::Boolean { must, .. } => assert_eq!(must.len(), 2),
            _ => panic!("expected boolean"),
        }
    }
}
