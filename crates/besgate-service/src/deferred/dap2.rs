//! DAP4 to DAP2 request-descriptor rewriting.
//!
//! The execution path behind the gateway only understands DAP2 constraint
//! expressions. DAP4 requests carry their constraint in separate pieces, a
//! projection (`proj`) plus zero or more selection clauses (`sel`), so a
//! DAP4 data request that is due for execution is first collapsed into the
//! single combined expression DAP2 expects. The rewrite is a pure function
//! of the descriptor; it carries no state and drops nothing except the
//! representation difference.

use crate::bes::{BesCommand, BesOperation};

/// Collapses a DAP4 projection and selection clauses into one DAP2
/// constraint expression.
///
/// The projection comes first, then each selection clause, all joined with
/// `&`. Returns `None` when there is nothing to constrain.
pub fn collapse_constraint(projection: Option<&str>, selections: &[String]) -> Option<String> {
    let mut dap2 = String::new();
    if let Some(projection) = projection {
        dap2.push_str(projection);
    }
    for clause in selections {
        if !dap2.is_empty() {
            dap2.push('&');
        }
        dap2.push_str(clause);
    }
    if dap2.is_empty() { None } else { Some(dap2) }
}

/// Rewrites a DAP4 data descriptor into its DAP2 equivalent.
///
/// Non-DAP4 descriptors pass through unchanged.
pub fn to_dap2(command: &BesCommand) -> BesCommand {
    match &command.operation {
        BesOperation::Dap4Data {
            projection,
            selections,
        } => BesCommand {
            resource: command.resource.clone(),
            operation: BesOperation::Dap2Data {
                constraint: collapse_constraint(projection.as_deref(), selections),
            },
            timeout: command.timeout,
        },
        _ => command.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collapse_projection_and_selections() {
        let sels = vec!["u>10".to_owned(), "v<3".to_owned()];
        assert_eq!(
            collapse_constraint(Some("u,v"), &sels),
            Some("u,v&u>10&v<3".to_owned())
        );
    }

    #[test]
    fn test_collapse_projection_only() {
        assert_eq!(
            collapse_constraint(Some("sst[0:10]"), &[]),
            Some("sst[0:10]".to_owned())
        );
    }

    #[test]
    fn test_collapse_selections_only() {
        let sels = vec!["time>5".to_owned()];
        assert_eq!(collapse_constraint(None, &sels), Some("time>5".to_owned()));
    }

    #[test]
    fn test_collapse_empty() {
        assert_eq!(collapse_constraint(None, &[]), None);
    }

    #[test]
    fn test_to_dap2_rewrites_dap4() {
        let dap4 = BesCommand {
            resource: "/data/sst.nc".to_owned(),
            operation: BesOperation::Dap4Data {
                projection: Some("sst".to_owned()),
                selections: vec!["time>5".to_owned()],
            },
            timeout: None,
        };
        let dap2 = to_dap2(&dap4);
        assert_eq!(dap2.resource, "/data/sst.nc");
        assert_eq!(
            dap2.operation,
            BesOperation::Dap2Data {
                constraint: Some("sst&time>5".to_owned()),
            }
        );
    }

    #[test]
    fn test_to_dap2_passes_through_dap2() {
        let dap2 = BesCommand {
            resource: "/data/sst.nc".to_owned(),
            operation: BesOperation::Dap2Data { constraint: None },
            timeout: None,
        };
        assert_eq!(to_dap2(&dap2), dap2);
    }
}
