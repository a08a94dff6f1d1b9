//! The policy engine consulted per RPC. Policies are casbin-style CSV
//! rules (`p, subject, object, action`); the object column supports the
//! `*` wildcard. The model file is accepted for compatibility with
//! existing deployments and validated for presence.

use crate::AuthResult;
use crate::errors::AuthError;
use std::fs;
use std::path::Path;
use tracing::{debug, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
struct Policy {
    subject: String,
    object: String,
    action: String,
}

pub struct Authorizer {
    policies: Vec<Policy>,
}

impl Authorizer {
    #[instrument(skip_all, fields(model = ?model.as_ref(), policy = ?policy.as_ref()))]
    pub fn new(model: impl AsRef<Path>, policy: impl AsRef<Path>) -> AuthResult<Self> {
        // the matcher is fixed; the model file just has to be there
        fs::metadata(model.as_ref()).map_err(|source| AuthError::Model {
            path: model.as_ref().to_string_lossy().into_owned(),
            source,
        })?;

        let path_str = policy.as_ref().to_string_lossy().into_owned();
        let contents = fs::read_to_string(policy.as_ref()).map_err(|source| AuthError::Policy {
            path: path_str.clone(),
            source,
        })?;

        let mut policies = Vec::new();
        for (i, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.split(',').map(str::trim);
            let rule = (
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
                fields.next(),
            );
            match rule {
                (Some("p"), Some(subject), Some(object), Some(action), None) => {
                    policies.push(Policy {
                        subject: subject.to_string(),
                        object: object.to_string(),
                        action: action.to_string(),
                    });
                }
                _ => {
                    return Err(AuthError::Malformed {
                        path: path_str,
                        line: i + 1,
                    });
                }
            }
        }

        debug!(rules = policies.len(), "Policy loaded");
        Ok(Self { policies })
    }

    /// Checks whether `subject` may perform `action` on `object`.
    pub fn authorize(&self, subject: &str, object: &str, action: &str) -> AuthResult<()> {
        let allowed = self.policies.iter().any(|p| {
            p.subject == subject
                && (p.object == "*" || p.object == object)
                && p.action == action
        });

        if allowed {
            Ok(())
        } else {
            Err(AuthError::Denied {
                subject: subject.to_string(),
                object: object.to_string(),
                action: action.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_files(dir: &TempDir, policy: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let model = dir.path().join("model.conf");
        let policy_path = dir.path().join("policy.csv");
        fs::File::create(&model)
            .unwrap()
            .write_all(b"[request_definition]\nr = sub, obj, act\n")
            .unwrap();
        fs::write(&policy_path, policy).unwrap();
        (model, policy_path)
    }

    #[test]
    fn test_authorize_wildcard_object() -> AuthResult<()> {
        let dir = TempDir::new().unwrap();
        let (model, policy) = write_files(&dir, "p, root, *, produce\np, root, *, consume\n");

        let authorizer = Authorizer::new(model, policy)?;

        authorizer.authorize("root", "*", "produce")?;
        authorizer.authorize("root", "some-log", "consume")?;

        Ok(())
    }

    #[test]
    fn test_denied_subject_and_action() -> AuthResult<()> {
        let dir = TempDir::new().unwrap();
        let (model, policy) = write_files(&dir, "p, nobody, *, consume\n");

        let authorizer = Authorizer::new(model, policy)?;

        assert!(matches!(
            authorizer.authorize("nobody", "*", "produce"),
            Err(AuthError::Denied { .. })
        ));
        assert!(matches!(
            authorizer.authorize("stranger", "*", "consume"),
            Err(AuthError::Denied { .. })
        ));
        authorizer.authorize("nobody", "*", "consume")?;

        Ok(())
    }

    #[test]
    fn test_malformed_policy_rejected() {
        let dir = TempDir::new().unwrap();
        let (model, policy) = write_files(&dir, "p, broken-rule\n");

        assert!(matches!(
            Authorizer::new(model, policy),
            Err(AuthError::Malformed { line: 1, .. })
        ));
    }

    #[test]
    fn test_comments_and_blank_lines_ignored() -> AuthResult<()> {
        let dir = TempDir::new().unwrap();
        let (model, policy) =
            write_files(&dir, "# acl rules\n\np, root, *, produce\n");

        let authorizer = Authorizer::new(model, policy)?;
        authorizer.authorize("root", "*", "produce")?;

        Ok(())
    }
}
