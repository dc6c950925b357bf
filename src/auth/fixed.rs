use super::{
    AuthorityError, CredentialRequest, CredentialResponse, IdentityAuthority, Permission, WILDCARD,
};
use crate::tenant::is_valid_tenant_id;
use async_trait::async_trait;
use std::str::FromStr;

/// Statically configured account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedAccount {
    pub username: String,
    pub password: String,
    pub tenant: String,
    pub permissions: Vec<String>,
}

/// Split on `:`, honouring `\\:` and `\\\\` escapes
fn split_fields(s: &str) -> Result<Vec<String>, String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some(escaped) => current.push(escaped),
                None => return Err("trailing '\\' in account".to_string()),
            },
            ':' => fields.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    fields.push(current);
    Ok(fields)
}

impl FromStr for FixedAccount {
    type Err = String;

    /// Parse `user:password:tenant[:perm+perm]`; permissions default to `*`.
    /// A `:` inside the password is written `\\:`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = split_fields(s)?.into_iter();
        let (Some(username), Some(password), Some(tenant), perms, None) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(format!(
                "expected user:password:tenant[:permissions] (escape ':' as '\\:'), got {:?}",
                s
            ));
        };
        if username.is_empty() {
            return Err("username must not be empty".to_string());
        }
        if !is_valid_tenant_id(&tenant) {
            return Err(format!("invalid tenant id {:?}", tenant));
        }

        let permissions = match perms {
            Some(perms) => {
                let tokens: Vec<String> = perms.split('+').map(str::to_string).collect();
                if let Some(unknown) = tokens
                    .iter()
                    .find(|t| t.as_str() != WILDCARD && Permission::from_token(t).is_none())
                {
                    return Err(format!("unknown permission {:?}", unknown));
                }
                tokens
            }
            None => vec![WILDCARD.to_string()],
        };

        Ok(Self {
            username,
            password,
            tenant,
            permissions,
        })
    }
}

/// Identity authority backed by an in-process account table, for
/// development and tests
pub struct FixedAuthority {
    accounts: Vec<FixedAccount>,
}

impl FixedAuthority {
    pub fn new(accounts: Vec<FixedAccount>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl IdentityAuthority for FixedAuthority {
    async fn validate(
        &self,
        request: &CredentialRequest,
    ) -> Result<CredentialResponse, AuthorityError> {
        self.accounts
            .iter()
            .find(|a| a.username == request.user && a.password == request.pass)
            .map(|a| CredentialResponse {
                server: a.tenant.clone(),
                permissions: a.permissions.clone(),
            })
            .ok_or(AuthorityError::InvalidCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tests::request;

    #[test]
    fn test_parse_account() {
        let account: FixedAccount = "alice:pw:tenant-7:list+read".parse().unwrap();
        assert_eq!(account.tenant, "tenant-7");
        assert_eq!(account.permissions, vec!["list", "read"]);

        let account: FixedAccount = "carol:pw:tenant-9".parse().unwrap();
        assert_eq!(account.permissions, vec![WILDCARD]);

        assert!("nobody".parse::<FixedAccount>().is_err());
        assert!(":pw:tenant".parse::<FixedAccount>().is_err());
    }

    #[test]
    fn test_colon_in_password() {
        let account: FixedAccount = r"dave:pa\:ss:tenant-7:read".parse().unwrap();
        assert_eq!(account.password, "pa:ss");
        assert_eq!(account.tenant, "tenant-7");

        // Unescaped, the shifted fields are caught instead of accepted
        assert!("dave:pa:ss:tenant-7".parse::<FixedAccount>().is_err());
        assert!("dave:pa:ss:tenant-7:read".parse::<FixedAccount>().is_err());
        assert!(r"dave:pw:tenant-7\".parse::<FixedAccount>().is_err());
    }

    #[tokio::test]
    async fn test_validate() {
        let authority = FixedAuthority::new(vec!["bob:correct:tenant-42:list+read".parse().unwrap()]);

        let response = authority.validate(&request("bob", "correct")).await.unwrap();
        assert_eq!(response.server, "tenant-42");
        assert_eq!(response.permissions, vec!["list", "read"]);

        assert!(matches!(
            authority.validate(&request("bob", "wrong")).await,
            Err(AuthorityError::InvalidCredentials)
        ));
    }
}
