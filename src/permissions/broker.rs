//! Decides whether an app may run, and under which policy.
//!
//! Paths, in order: trust-all bypass, stored "always" record, earlier "once"
//! in this process, default-safe manifest, and finally asking the user.
//! A denial is a normal [`Decision`], not an error.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use super::audit::{AuditAction, AuditLog};
use super::manifest::PermissionManifest;
use super::trust_store::{PermissionRecord, TrustStore};
use crate::app_id::AppId;
use crate::context::{ExecutionContext, TRUST_ALL_ENV};
use crate::ipc::protocol::{Choice, SelectPrompt};
use crate::provider::prompt::{PromptAnswer, Prompter, sanitize_for_terminal};
use crate::sandbox::policy::{NetworkAccess, PolicyBuilder, SandboxPolicy};

const CHOICE_ONCE: &str = "once";
const CHOICE_ALWAYS: &str = "always";
const CHOICE_CANCEL: &str = "cancel";

/// How a decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionBasis {
    Bypass,
    Cached,
    Session,
    DefaultSafe,
    AllowOnce,
    AllowAlways,
    Cancelled,
    /// Prompt needed but nobody can answer it
    NonInteractive,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub granted: bool,
    pub policy: SandboxPolicy,
    pub allow_credentials: bool,
    pub basis: DecisionBasis,
}

impl Decision {
    fn grant(policy: SandboxPolicy, allow_credentials: bool, basis: DecisionBasis) -> Self {
        Self {
            granted: true,
            policy,
            allow_credentials,
            basis,
        }
    }

    fn deny(policy: SandboxPolicy, basis: DecisionBasis) -> Self {
        Self {
            granted: false,
            policy,
            allow_credentials: false,
            basis,
        }
    }

    /// Message shown when the run is refused.
    pub fn denial_message(&self) -> Option<String> {
        match self.basis {
            _ if self.granted => None,
            DecisionBasis::NonInteractive => Some(format!(
                "Permission denied: this app needs approval and no terminal is available. \
                 Set {}=1 to trust it explicitly.",
                TRUST_ALL_ENV
            )),
            _ => Some("Permission denied".to_string()),
        }
    }
}

pub struct PermissionBroker {
    store: TrustStore,
    builder: PolicyBuilder,
    prompter: Arc<dyn Prompter>,
    trust_all: bool,
    audit: Option<AuditLog>,
    /// "Allow once" grants, alive for this process only
    session: Mutex<HashMap<AppId, Decision>>,
}

impl PermissionBroker {
    pub fn new(
        store: TrustStore,
        builder: PolicyBuilder,
        prompter: Arc<dyn Prompter>,
        trust_all: bool,
    ) -> Self {
        Self {
            store,
            builder,
            prompter,
            trust_all,
            audit: None,
            session: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_context(ctx: &ExecutionContext, prompter: Arc<dyn Prompter>) -> Self {
        Self::new(
            TrustStore::open(&ctx.paths),
            PolicyBuilder::from_context(ctx),
            prompter,
            ctx.trust_all,
        )
        .with_audit(AuditLog::new(ctx.paths.audit_log()))
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn store(&self) -> &TrustStore {
        &self.store
    }

    /// Stored "always" record for `app`.
    pub fn is_granted(&self, app: &AppId) -> Result<Option<PermissionRecord>> {
        self.store.get(app)
    }

    pub async fn decide(
        &self,
        app: &AppId,
        manifest: Option<&PermissionManifest>,
    ) -> Result<Decision> {
        if self.trust_all {
            info!("{} is set, trusting {} without asking", TRUST_ALL_ENV, app);
            let decision = Decision::grant(
                self.builder.build_unrestricted(),
                true,
                DecisionBasis::Bypass,
            );
            self.audit(AuditAction::Bypassed, app, &decision);
            return Ok(decision);
        }

        if let Some(record) = self.store.get(app)? {
            debug!("Using stored permissions for {}", app);
            let decision =
                Decision::grant(record.policy, record.allow_credentials, DecisionBasis::Cached);
            self.audit(AuditAction::Cached, app, &decision);
            return Ok(decision);
        }

        if let Some(decision) = self.session_grant(app) {
            debug!("Reusing this session's grant for {}", app);
            self.audit(AuditAction::SessionCached, app, &decision);
            return Ok(decision);
        }

        if let Some(m) = manifest.filter(|m| m.is_default_safe()) {
            let decision =
                Decision::grant(self.builder.build(Some(m)), false, DecisionBasis::DefaultSafe);
            self.audit(AuditAction::DefaultSafe, app, &decision);
            return Ok(decision);
        }

        self.prompt(app, manifest).await
    }

    async fn prompt(&self, app: &AppId, manifest: Option<&PermissionManifest>) -> Result<Decision> {
        let requested = manifest
            .cloned()
            .unwrap_or_else(PermissionManifest::undeclared);
        let policy = self.builder.build(Some(&requested));
        let allow_credentials = requested.api_keys;

        if !self.prompter.is_interactive() {
            let decision = Decision::deny(policy, DecisionBasis::NonInteractive);
            self.audit(AuditAction::Denied, app, &decision);
            return Ok(decision);
        }

        let prompt = SelectPrompt {
            message: permission_summary(app, manifest.is_none(), allow_credentials, &policy),
            choices: vec![
                Choice::new(CHOICE_ONCE, "Allow once"),
                Choice::new(CHOICE_ALWAYS, "Always allow"),
                Choice::new(CHOICE_CANCEL, "Cancel"),
            ],
        };

        let decision = match self.prompter.select(&prompt).await? {
            PromptAnswer::Answered(choice) if choice == CHOICE_ONCE => {
                let decision = Decision::grant(policy, allow_credentials, DecisionBasis::AllowOnce);
                self.remember_for_session(app, &decision);
                self.audit(AuditAction::GrantedOnce, app, &decision);
                decision
            }
            PromptAnswer::Answered(choice) if choice == CHOICE_ALWAYS => {
                self.store.grant(
                    app,
                    PermissionRecord::always(policy.clone(), allow_credentials),
                )?;
                let decision =
                    Decision::grant(policy, allow_credentials, DecisionBasis::AllowAlways);
                self.audit(AuditAction::GrantedAlways, app, &decision);
                decision
            }
            _ => {
                let decision = Decision::deny(policy, DecisionBasis::Cancelled);
                self.audit(AuditAction::Denied, app, &decision);
                decision
            }
        };
        Ok(decision)
    }

    /// Forget the stored decision for `app`.
    pub fn revoke(&self, app: &AppId) -> Result<bool> {
        let removed = self.store.revoke(app)?;
        if let Ok(mut session) = self.session.lock() {
            session.remove(app);
        }
        if removed {
            if let Some(ref audit) = self.audit {
                audit.record(AuditAction::Revoked, Some(app), None, None);
            }
        }
        Ok(removed)
    }

    /// Forget every stored decision.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.store.clear()?;
        if let Ok(mut session) = self.session.lock() {
            session.clear();
        }
        if let Some(ref audit) = self.audit {
            audit.record(
                AuditAction::Cleared,
                None,
                None,
                Some(&format!("{} app(s) removed", removed)),
            );
        }
        Ok(removed)
    }

    fn session_grant(&self, app: &AppId) -> Option<Decision> {
        let session = self.session.lock().ok()?;
        session.get(app).map(|d| Decision {
            basis: DecisionBasis::Session,
            ..d.clone()
        })
    }

    fn remember_for_session(&self, app: &AppId, decision: &Decision) {
        if let Ok(mut session) = self.session.lock() {
            session.insert(app.clone(), decision.clone());
        }
    }

    fn audit(&self, action: AuditAction, app: &AppId, decision: &Decision) {
        if let Some(ref audit) = self.audit {
            audit.record(action, Some(app), Some(&decision.policy), None);
        }
    }
}

/// One block listing every non-default capability the app wants.
pub fn permission_summary(
    app: &AppId,
    undeclared: bool,
    allow_credentials: bool,
    policy: &SandboxPolicy,
) -> String {
    let kind = if app.is_local() { "Local script" } else { "App" };
    let mut lines = vec![format!(
        "{} {} requests additional permissions:",
        kind,
        sanitize_for_terminal(app.as_str())
    )];

    if undeclared {
        lines.push("  - (no permission manifest could be read; assuming full request)".to_string());
    }
    if allow_credentials {
        lines.push("  - Access to your LLM API keys".to_string());
    }

    match policy.allowed_domains {
        NetworkAccess::Unrestricted => lines.push("  - Unrestricted network access".to_string()),
        NetworkAccess::AllowList(ref domains) if !domains.is_empty() => {
            lines.push("  - Network access to:".to_string());
            for domain in domains {
                lines.push(format!("      {}", sanitize_for_terminal(domain)));
            }
        }
        NetworkAccess::AllowList(_) => {}
    }

    // The first allowWrite entry is always the working directory.
    let extra_writes: Vec<_> = policy.allow_write.iter().skip(1).collect();
    if !extra_writes.is_empty() {
        lines.push("  - Write access to:".to_string());
        for path in extra_writes {
            lines.push(format!("      {}", sanitize_for_terminal(&path.to_string_lossy())));
        }
    }

    // The first two denyRead entries are kly's own files.
    let app_denies: Vec<_> = policy.deny_read.iter().skip(2).collect();
    if !app_denies.is_empty() {
        lines.push("  - Hidden from the app:".to_string());
        for path in app_denies {
            lines.push(format!("      {}", sanitize_for_terminal(&path.to_string_lossy())));
        }
    }

    lines.join("\n")
}
