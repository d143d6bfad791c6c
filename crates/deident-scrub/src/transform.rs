//! Output column layout of scrubbed tables.

use deident_core::{Error, IdentitySchema, Result};

/// Column list of `table` after scrubbing.
///
/// Undeclared columns keep their order; each declared column is removed and,
/// if it carries a linking type, its research id column is appended.
pub fn transform_columns<S: AsRef<str>>(
    schema: &IdentitySchema,
    table: &str,
    input_columns: &[S],
) -> Result<Vec<String>> {
    let input: Vec<&str> = input_columns.iter().map(AsRef::as_ref).collect();
    let Some(identity) = schema.table(table) else {
        return Ok(input.into_iter().map(str::to_string).collect());
    };

    let missing: Vec<&str> = identity
        .rules()
        .map(|r| r.column.as_str())
        .filter(|c| !input.contains(c))
        .collect();
    if !missing.is_empty() {
        return Err(Error::Verification(format!(
            "table {} lacks declared columns: {}",
            table,
            missing.join(", ")
        )));
    }

    let mut output: Vec<String> = input
        .iter()
        .filter(|c| identity.column(c).is_none())
        .map(|c| c.to_string())
        .collect();
    output.extend(
        input
            .iter()
            .filter_map(|c| identity.column(c))
            .filter_map(|rule| rule.output_column()),
    );
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> IdentitySchema {
        IdentitySchema::from_json(&json!({
            "users": {
                "user_id": ["DatasetId"],
                "unique_name": ["Other"],
                "sis_user_id": ["InstitutionalId", "GuestId"]
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_transform_columns() {
        let cols = transform_columns(
            &schema(),
            "users",
            &["sis_user_id", "name_sortable", "user_id", "unique_name", "created_at"],
        )
        .unwrap();
        assert_eq!(
            cols,
            vec![
                "name_sortable",
                "created_at",
                "sis_user_id_research_id",
                "user_id_research_id"
            ]
        );
    }

    #[test]
    fn test_missing_declared_column() {
        let err = transform_columns(&schema(), "users", &["user_id"]).unwrap_err();
        assert!(matches!(err, Error::Verification(_)));
    }

    #[test]
    fn test_undeclared_table_unchanged() {
        let cols = transform_columns(&schema(), "courses", &["id", "title"]).unwrap();
        assert_eq!(cols, vec!["id", "title"]);
    }
}
