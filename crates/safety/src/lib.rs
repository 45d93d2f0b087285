use uuid::Uuid;

pub const TOKEN_PREFIX: &str = "BSM-";

#[derive(Debug, Clone)]
pub struct SafetyContext {
    pub force: bool,
    pub dry_run: bool,
    pub confirmation_token: Option<String>,
}

#[derive(Debug, Clone)]
pub enum SafetyDecision {
    Allow,
    Deny(String),
}

pub fn require_confirmation_token() -> String {
    format!("{}{}", TOKEN_PREFIX, Uuid::new_v4())
}

pub fn can_write_to_disk(
    ctx: &SafetyContext,
    is_system_disk: bool,
    removable: bool,
) -> SafetyDecision {
    if is_system_disk {
        return SafetyDecision::Deny("Denied: refusing to write to the system disk".to_string());
    }

    if !removable && !ctx.force {
        return SafetyDecision::Deny(
            "Denied: target disk is not removable (use force to override)".to_string(),
        );
    }

    // Dry runs never write, so no token is demanded for them.
    if ctx.dry_run {
        return SafetyDecision::Allow;
    }

    let Some(token) = &ctx.confirmation_token else {
        return SafetyDecision::Deny("Denied: confirmation token missing".to_string());
    };
    if !token.starts_with(TOKEN_PREFIX) {
        return SafetyDecision::Deny("Denied: invalid confirmation token".to_string());
    }

    SafetyDecision::Allow
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(force: bool, dry_run: bool, token: Option<&str>) -> SafetyContext {
        SafetyContext {
            force,
            dry_run,
            confirmation_token: token.map(str::to_string),
        }
    }

    #[test]
    fn denies_system_disk_even_with_force() {
        let decision = can_write_to_disk(&ctx(true, false, Some("BSM-abc")), true, true);
        assert!(matches!(decision, SafetyDecision::Deny(_)));
    }

    #[test]
    fn denies_fixed_disk_without_force() {
        let decision = can_write_to_disk(&ctx(false, false, Some("BSM-abc")), false, false);
        assert!(matches!(decision, SafetyDecision::Deny(_)));
    }

    #[test]
    fn allows_fixed_disk_with_force() {
        let decision = can_write_to_disk(&ctx(true, false, Some("BSM-abc")), false, false);
        assert!(matches!(decision, SafetyDecision::Allow));
    }

    #[test]
    fn denies_without_token() {
        let decision = can_write_to_disk(&ctx(false, false, None), false, true);
        assert!(matches!(decision, SafetyDecision::Deny(_)));
    }

    #[test]
    fn denies_invalid_token() {
        let decision = can_write_to_disk(&ctx(false, false, Some("BAD")), false, true);
        assert!(matches!(decision, SafetyDecision::Deny(_)));
    }

    #[test]
    fn allows_removable_disk_with_token() {
        let decision = can_write_to_disk(&ctx(false, false, Some("BSM-123")), false, true);
        assert!(matches!(decision, SafetyDecision::Allow));
    }

    #[test]
    fn dry_run_needs_no_token() {
        let decision = can_write_to_disk(&ctx(false, true, None), false, true);
        assert!(matches!(decision, SafetyDecision::Allow));
    }

    #[test]
    fn issued_tokens_pass_the_gate() {
        let token = require_confirmation_token();
        let decision = can_write_to_disk(&ctx(false, false, Some(&token)), false, true);
        assert!(matches!(decision, SafetyDecision::Allow));
    }
}
