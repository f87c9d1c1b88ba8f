//! Reconciliation engine.
//!
//! One pass compares the desired sharing state against the grants the media
//! server reports and issues the smallest set of corrective calls. Nothing is
//! cached between passes; every pass starts from a fresh snapshot.
//!
//! Calls run in two phases. All revocations go first, then creates and
//! updates. Accounts are processed concurrently; calls for one account stay
//! in order. A failure is isolated to its account except `Unauthorized`,
//! which aborts the pass.

use crate::error::ShareError;
use crate::models::{
    AccountRef, Credential, DesiredGrant, DesiredShareState, FilterRules, GrantId, GrantStatus,
    Library, LibrarySelection, RemoteId, RemoteUser, SchemaMismatch, ServerId, ShareGrant,
    ShareInvite, SharePatch,
};
use crate::services::client::MediaServerApi;
use crate::services::metrics;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Create,
    Update,
    Revoke,
    Noop,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Revoke => "revoke",
            Self::Noop => "noop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The call succeeded; the grant now has this status.
    Applied(GrantStatus),
    Unchanged,
    /// Retryable failure; the next pass tries again.
    Deferred(ShareError),
    Failed(ShareError),
    /// Not attempted because an earlier step for the same account failed.
    Skipped,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applied(_) => "applied",
            Self::Unchanged => "unchanged",
            Self::Deferred(_) => "deferred",
            Self::Failed(_) => "failed",
            Self::Skipped => "skipped",
        }
    }

    fn from_error(err: ShareError) -> Self {
        if err.is_retryable() {
            Self::Deferred(err)
        } else {
            Self::Failed(err)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Applied(_) | Self::Unchanged)
    }
}

/// What happened to one account in one step of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountResult {
    pub account: AccountRef,
    pub action: Action,
    pub grant_id: Option<GrantId>,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub server_id: ServerId,
    pub results: Vec<AccountResult>,
    pub warnings: Vec<SchemaMismatch>,
}

impl ReconcileReport {
    /// Every step succeeded or needed no call.
    pub fn converged(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_success())
    }

    /// Results for one account, in the order they were produced.
    pub fn for_account(&self, account: &AccountRef) -> Vec<&AccountResult> {
        self.results.iter().filter(|r| &r.account == account).collect()
    }

    pub fn count(&self, action: Action) -> usize {
        self.results
            .iter()
            .filter(|r| r.action == action && r.outcome != Outcome::Unchanged)
            .count()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "server {}: {} created, {} updated, {} revoked, {} unchanged, {} warnings",
            self.server_id,
            self.count(Action::Create),
            self.count(Action::Update),
            self.count(Action::Revoke),
            self.results.iter().filter(|r| r.action == Action::Noop).count(),
            self.warnings.len()
        )
    }
}

/// Phase-two step for one account.
#[derive(Debug, Clone)]
enum Step {
    Create(ShareInvite),
    Update {
        server_id: ServerId,
        grant_id: GrantId,
        patch: SharePatch,
    },
}

/// Everything the pass will do for one account.
#[derive(Debug)]
struct AccountPlan {
    account: AccountRef,
    revocations: Vec<GrantId>,
    step: Option<Step>,
    /// Settled while planning: no call needed, or no call possible.
    settled: Option<(Action, Option<GrantId>, Outcome)>,
}

impl AccountPlan {
    fn new(account: AccountRef) -> Self {
        Self {
            account,
            revocations: Vec::new(),
            step: None,
            settled: None,
        }
    }
}

/// Email/id lookups built from the user listing, so a policy keyed by email
/// matches a grant that only carries the remote id and vice versa.
struct Directory {
    email_by_id: HashMap<RemoteId, String>,
    id_by_email: HashMap<String, RemoteId>,
}

impl Directory {
    fn new(users: &[RemoteUser]) -> Self {
        let mut email_by_id = HashMap::new();
        let mut id_by_email = HashMap::new();
        for user in users {
            if let Some(email) = &user.email {
                let email = email.to_ascii_lowercase();
                email_by_id.insert(user.remote_id.clone(), email.clone());
                id_by_email.insert(email, user.remote_id.clone());
            }
        }
        Self {
            email_by_id,
            id_by_email,
        }
    }

    /// The id a policy key stands for when the directory knows it, so two
    /// keys naming one person collapse to the same account.
    fn canonical(&self, account: &AccountRef) -> AccountRef {
        match account {
            AccountRef::Email(email) => self
                .id_by_email
                .get(email)
                .map(|id| AccountRef::Id(id.clone()))
                .unwrap_or_else(|| account.clone()),
            AccountRef::Id(_) => account.clone(),
        }
    }

    fn matches(&self, grant: &ShareGrant, account: &AccountRef) -> bool {
        if grant.invitee.matches(account) {
            return true;
        }
        match account {
            AccountRef::Id(id) => self
                .email_by_id
                .get(id)
                .is_some_and(|email| grant.invitee.matches(&AccountRef::Email(email.clone()))),
            AccountRef::Email(email) => self
                .id_by_email
                .get(email)
                .is_some_and(|id| grant.invitee.matches(&AccountRef::Id(id.clone()))),
        }
    }
}

pub struct ReconcileEngine {
    api: Arc<dyn MediaServerApi>,
    max_concurrency: usize,
}

impl ReconcileEngine {
    pub fn new(api: Arc<dyn MediaServerApi>, max_concurrency: usize) -> Self {
        Self {
            api,
            max_concurrency: max_concurrency.max(1),
        }
    }

    /// Run one pass for `desired` under `credential`.
    #[instrument(skip_all, fields(server_id = %desired.server_id))]
    pub async fn run(
        &self,
        credential: &Credential,
        desired: &DesiredShareState,
    ) -> Result<ReconcileReport, ShareError> {
        let server_id = &desired.server_id;
        let (users, libraries, shares) = tokio::try_join!(
            self.api.fetch_users(credential),
            self.api.fetch_server_libraries(credential, server_id),
            self.api.fetch_shares(credential, server_id),
        )?;

        let mut warnings = users.warnings;
        warnings.extend(shares.warnings);

        let directory = Directory::new(&users.items);
        let current: Vec<(GrantId, ShareGrant)> = shares
            .items
            .into_iter()
            .filter(|g| &g.server_id == server_id && g.is_live())
            .filter_map(|g| Some((g.grant_id.clone()?, g)))
            .collect();

        let plans = plan(desired, &libraries, &current, &directory);
        tracing::info!(
            accounts = plans.len(),
            current_grants = current.len(),
            warnings = warnings.len(),
            "Reconciliation planned"
        );

        let results = self.execute(credential, plans).await?;
        for result in &results {
            metrics::record_action(result.action.as_str(), result.outcome.as_str());
        }

        let report = ReconcileReport {
            server_id: server_id.clone(),
            results,
            warnings,
        };
        tracing::info!(summary = %report, converged = report.converged(), "Reconciliation finished");
        Ok(report)
    }

    async fn execute(
        &self,
        credential: &Credential,
        plans: Vec<AccountPlan>,
    ) -> Result<Vec<AccountResult>, ShareError> {
        let mut results = Vec::new();

        // Phase one: revocations.
        let mut revoked_ok: HashMap<AccountRef, bool> = HashMap::new();
        let pending: Vec<(AccountRef, Vec<GrantId>)> = plans
            .iter()
            .filter(|p| !p.revocations.is_empty())
            .map(|p| (p.account.clone(), p.revocations.clone()))
            .collect();
        {
            let mut revocations = stream::iter(pending)
                .map(|(account, grant_ids)| self.revoke_all(credential, account, grant_ids))
                .buffer_unordered(self.max_concurrency);

            while let Some((account, steps)) = revocations.next().await {
                let all_ok = steps.iter().all(|r| r.outcome.is_success());
                abort_on_unauthorized(&steps)?;
                revoked_ok.insert(account, all_ok);
                results.extend(steps);
            }
        }

        // Phase two: creates and updates.
        let mut followups = Vec::new();
        for plan in plans {
            if let Some((action, grant_id, outcome)) = plan.settled {
                results.push(AccountResult {
                    account: plan.account,
                    action,
                    grant_id,
                    outcome,
                });
                continue;
            }
            let Some(step) = plan.step else {
                continue;
            };
            if !revoked_ok.get(&plan.account).copied().unwrap_or(true) {
                let (action, grant_id) = match &step {
                    Step::Create(_) => (Action::Create, None),
                    Step::Update { grant_id, .. } => (Action::Update, Some(grant_id.clone())),
                };
                results.push(AccountResult {
                    account: plan.account,
                    action,
                    grant_id,
                    outcome: Outcome::Skipped,
                });
                continue;
            }
            followups.push((plan.account, step));
        }

        let mut applied = stream::iter(followups)
            .map(|(account, step)| self.apply(credential, account, step))
            .buffer_unordered(self.max_concurrency);
        while let Some(result) = applied.next().await {
            abort_on_unauthorized(std::slice::from_ref(&result))?;
            results.push(result);
        }

        Ok(results)
    }

    /// Revoke an account's grants in order, stopping at the first failure.
    async fn revoke_all(
        &self,
        credential: &Credential,
        account: AccountRef,
        grant_ids: Vec<GrantId>,
    ) -> (AccountRef, Vec<AccountResult>) {
        let mut steps = Vec::with_capacity(grant_ids.len());
        let mut failed = false;
        for grant_id in grant_ids {
            let outcome = if failed {
                Outcome::Skipped
            } else {
                match self.api.revoke_share(credential, &grant_id).await {
                    Ok(()) => Outcome::Applied(GrantStatus::Revoked),
                    Err(err) => {
                        tracing::warn!(account = %account, %grant_id, error = %err, "Revoke failed");
                        failed = true;
                        Outcome::from_error(err)
                    }
                }
            };
            steps.push(AccountResult {
                account: account.clone(),
                action: Action::Revoke,
                grant_id: Some(grant_id),
                outcome,
            });
        }
        (account, steps)
    }

    async fn apply(&self, credential: &Credential, account: AccountRef, step: Step) -> AccountResult {
        match step {
            Step::Create(invite) => {
                let (grant_id, outcome) = match self.api.create_share(credential, &invite).await {
                    Ok(grant) => (grant.grant_id, Outcome::Applied(grant.status)),
                    Err(err) => {
                        tracing::warn!(account = %account, error = %err, "Create failed");
                        (None, Outcome::from_error(err))
                    }
                };
                AccountResult {
                    account,
                    action: Action::Create,
                    grant_id,
                    outcome,
                }
            }
            Step::Update {
                server_id,
                grant_id,
                patch,
            } => {
                let outcome = match self
                    .api
                    .update_share(credential, &server_id, &grant_id, &patch)
                    .await
                {
                    Ok(grant) => Outcome::Applied(grant.status),
                    Err(err) => {
                        tracing::warn!(account = %account, %grant_id, error = %err, "Update failed");
                        Outcome::from_error(err)
                    }
                };
                AccountResult {
                    account,
                    action: Action::Update,
                    grant_id: Some(grant_id),
                    outcome,
                }
            }
        }
    }
}

/// Decide what each account needs. Pure: no calls are made here.
fn plan(
    desired: &DesiredShareState,
    libraries: &[Library],
    current: &[(GrantId, ShareGrant)],
    directory: &Directory,
) -> Vec<AccountPlan> {
    let server_id = &desired.server_id;
    let mut claimed = vec![false; current.len()];
    let mut plans = Vec::new();

    let mut by_account: BTreeMap<AccountRef, Vec<(&AccountRef, &DesiredGrant)>> = BTreeMap::new();
    for (key, wanted) in &desired.grants {
        by_account
            .entry(directory.canonical(key))
            .or_default()
            .push((key, wanted));
    }

    for (canonical, entries) in by_account {
        let (account, wanted) = entries[0];
        let conflicting = entries.iter().any(|(_, other)| *other != wanted);

        // An empty selection means the account should have no grant at all.
        if !conflicting && wanted.libraries.is_empty() {
            continue;
        }

        let matching: Vec<usize> = current
            .iter()
            .enumerate()
            .filter(|(i, (_, grant))| !claimed[*i] && directory.matches(grant, &canonical))
            .map(|(i, _)| i)
            .collect();
        for &i in &matching {
            claimed[i] = true;
        }
        let (unresolved_action, unresolved_grant) = match matching.first() {
            Some(&i) => (Action::Update, Some(current[i].0.clone())),
            None => (Action::Create, None),
        };

        // Keys that disagree about one account leave its grants untouched.
        if conflicting {
            tracing::warn!(
                account = %canonical,
                keys = entries.len(),
                "Sharing policy names one account under conflicting keys"
            );
            for (key, _) in entries {
                let mut plan = AccountPlan::new(key.clone());
                plan.settled = Some((
                    unresolved_action,
                    unresolved_grant.clone(),
                    Outcome::Failed(ShareError::DuplicateAccount(canonical.to_string())),
                ));
                plans.push(plan);
            }
            continue;
        }
        if entries.len() > 1 {
            tracing::debug!(account = %canonical, keys = entries.len(), "Merged policy aliases");
        }

        let mut plan = AccountPlan::new(account.clone());
        let target = match wanted.libraries.resolve(libraries) {
            Ok(target) => target,
            Err(err) => {
                tracing::warn!(account = %account, error = %err, "Cannot resolve desired libraries");
                plan.settled = Some((unresolved_action, unresolved_grant, Outcome::Failed(err)));
                plans.push(plan);
                continue;
            }
        };

        let invite = ShareInvite {
            server_id: server_id.clone(),
            invitee: account.clone(),
            libraries: target.clone(),
            filters: wanted.filters.clone(),
        };

        // Keep the closest grant: an exact match first, then an accepted one.
        let best = matching.iter().copied().min_by_key(|&i| {
            let grant = &current[i].1;
            (
                !same_access(grant, &target, &wanted.filters),
                grant.status == GrantStatus::Pending,
            )
        });
        let Some(best) = best else {
            plan.step = Some(Step::Create(invite));
            plans.push(plan);
            continue;
        };

        plan.revocations.extend(
            matching
                .iter()
                .filter(|&&i| i != best)
                .map(|&i| current[i].0.clone()),
        );

        let (grant_id, grant) = &current[best];
        if same_access(grant, &target, &wanted.filters) {
            plan.settled = Some((Action::Noop, Some(grant_id.clone()), Outcome::Unchanged));
        } else if grant.status == GrantStatus::Pending {
            // Unaccepted invites cannot be edited in place.
            plan.revocations.push(grant_id.clone());
            plan.step = Some(Step::Create(invite));
        } else {
            let patch = SharePatch {
                libraries: (grant.libraries != target).then_some(target),
                filters: grant.filters.changes_to(&wanted.filters),
            };
            plan.step = Some(Step::Update {
                server_id: server_id.clone(),
                grant_id: grant_id.clone(),
                patch,
            });
        }
        plans.push(plan);
    }

    // Whatever no desired account claimed gets revoked.
    let mut undesired: HashMap<AccountRef, usize> = HashMap::new();
    for (i, (grant_id, grant)) in current.iter().enumerate() {
        if claimed[i] {
            continue;
        }
        let account = grant
            .invitee
            .primary_ref()
            .unwrap_or_else(|| AccountRef::Id(RemoteId(grant_id.to_string())));
        let index = *undesired.entry(account.clone()).or_insert_with(|| {
            plans.push(AccountPlan::new(account));
            plans.len() - 1
        });
        plans[index].revocations.push(grant_id.clone());
    }

    plans
}

fn same_access(grant: &ShareGrant, libraries: &LibrarySelection, filters: &FilterRules) -> bool {
    &grant.libraries == libraries && &grant.filters == filters
}

fn abort_on_unauthorized(results: &[AccountResult]) -> Result<(), ShareError> {
    if results
        .iter()
        .any(|r| r.outcome == Outcome::Failed(ShareError::Unauthorized))
    {
        tracing::error!("Credential rejected mid-pass, aborting reconciliation");
        return Err(ShareError::Unauthorized);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DesiredLibraries, FilterScope, Invitee, MediaType};

    const SERVER: &str = "srv";

    fn catalog() -> Vec<Library> {
        vec![
            Library {
                key: "1".into(),
                title: "Movies".to_string(),
                media_type: MediaType::Movie,
            },
            Library {
                key: "2".into(),
                title: "TV Shows".to_string(),
                media_type: MediaType::Show,
            },
        ]
    }

    fn grant(id: &str, remote_id: &str, keys: &[&str], status: GrantStatus) -> (GrantId, ShareGrant) {
        (
            GrantId::from(id),
            ShareGrant {
                grant_id: Some(GrantId::from(id)),
                server_id: ServerId::from(SERVER),
                invitee: Invitee {
                    remote_id: Some(RemoteId::from(remote_id)),
                    email: None,
                    username: None,
                },
                libraries: LibrarySelection::only(keys.iter().copied()),
                filters: FilterRules::new(),
                status,
                accepted_at: None,
            },
        )
    }

    fn directory() -> Directory {
        Directory::new(&[crate::services::client::mock::remote_user(
            "42",
            "alice",
            Some("Alice@Example.com"),
        )])
    }

    #[test]
    fn identical_grant_needs_no_call() {
        let desired = DesiredShareState::new(SERVER).grant(
            "42",
            DesiredLibraries::named(["Movies"]),
            FilterRules::new(),
        );
        let current = vec![grant("g1", "42", &["1"], GrantStatus::Active)];

        let plans = plan(&desired, &catalog(), &current, &directory());
        assert_eq!(plans.len(), 1);
        assert!(plans[0].revocations.is_empty());
        assert!(plans[0].step.is_none());
        assert_eq!(
            plans[0].settled,
            Some((Action::Noop, Some(GrantId::from("g1")), Outcome::Unchanged))
        );
    }

    #[test]
    fn email_policy_matches_grant_by_directory_id() {
        let desired = DesiredShareState::new(SERVER).grant(
            "alice@example.com",
            DesiredLibraries::named(["1"]),
            FilterRules::new(),
        );
        let current = vec![grant("g1", "42", &["1"], GrantStatus::Active)];

        let plans = plan(&desired, &catalog(), &current, &directory());
        assert_eq!(plans.len(), 1);
        assert!(matches!(plans[0].settled, Some((Action::Noop, _, _))));
    }

    #[test]
    fn differing_grant_gets_minimal_patch() {
        let desired = DesiredShareState::new(SERVER).grant(
            "42",
            DesiredLibraries::named(["Movies"]),
            FilterRules::new().with(FilterScope::Movies, "label=kids"),
        );
        let current = vec![grant("g1", "42", &["1"], GrantStatus::Active)];

        let plans = plan(&desired, &catalog(), &current, &directory());
        match &plans[0].step {
            Some(Step::Update { grant_id, patch, .. }) => {
                assert_eq!(grant_id, &GrantId::from("g1"));
                assert_eq!(patch.libraries, None);
                assert_eq!(patch.filters.len(), 1);
                assert_eq!(patch.filters[&FilterScope::Movies], "label=kids");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn pending_invite_that_differs_is_recreated() {
        let desired = DesiredShareState::new(SERVER).grant(
            "42",
            DesiredLibraries::named(["Movies", "TV Shows"]),
            FilterRules::new(),
        );
        let current = vec![grant("g1", "42", &["1"], GrantStatus::Pending)];

        let plans = plan(&desired, &catalog(), &current, &directory());
        assert_eq!(plans[0].revocations, vec![GrantId::from("g1")]);
        assert!(matches!(plans[0].step, Some(Step::Create(_))));
    }

    #[test]
    fn duplicate_grants_keep_best_and_revoke_rest() {
        let desired = DesiredShareState::new(SERVER).grant(
            "42",
            DesiredLibraries::named(["Movies"]),
            FilterRules::new(),
        );
        let current = vec![
            grant("g1", "42", &["2"], GrantStatus::Active),
            grant("g2", "42", &["1"], GrantStatus::Active),
        ];

        let plans = plan(&desired, &catalog(), &current, &directory());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].revocations, vec![GrantId::from("g1")]);
        assert!(matches!(
            plans[0].settled,
            Some((Action::Noop, Some(ref id), _)) if id == &GrantId::from("g2")
        ));
    }

    #[test]
    fn empty_selection_is_treated_as_absent() {
        let desired = DesiredShareState::new(SERVER).grant(
            "42",
            DesiredLibraries::named(Vec::<String>::new()),
            FilterRules::new(),
        );
        let current = vec![grant("g1", "42", &["1"], GrantStatus::Active)];

        let plans = plan(&desired, &catalog(), &current, &directory());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].account, AccountRef::parse("42"));
        assert_eq!(plans[0].revocations, vec![GrantId::from("g1")]);
        assert!(plans[0].step.is_none());
    }

    #[test]
    fn unknown_library_fails_account_without_touching_grant() {
        let desired = DesiredShareState::new(SERVER).grant(
            "42",
            DesiredLibraries::named(["Anime"]),
            FilterRules::new(),
        );
        let current = vec![grant("g1", "42", &["1"], GrantStatus::Active)];

        let plans = plan(&desired, &catalog(), &current, &directory());
        assert_eq!(plans.len(), 1);
        assert!(plans[0].revocations.is_empty());
        assert_eq!(
            plans[0].settled,
            Some((
                Action::Update,
                Some(GrantId::from("g1")),
                Outcome::Failed(ShareError::UnknownLibrary("Anime".to_string()))
            ))
        );
    }

    #[test]
    fn id_and_email_keys_for_one_user_share_a_single_plan() {
        let desired = DesiredShareState::new(SERVER)
            .grant("42", DesiredLibraries::named(["Movies"]), FilterRules::new())
            .grant(
                "alice@example.com",
                DesiredLibraries::named(["1"]),
                FilterRules::new(),
            );

        let plans = plan(&desired, &catalog(), &[], &directory());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].account, AccountRef::parse("42"));
        assert!(matches!(plans[0].step, Some(Step::Create(_))));
    }

    #[test]
    fn conflicting_aliases_fail_and_keep_the_grant() {
        let desired = DesiredShareState::new(SERVER)
            .grant("42", DesiredLibraries::named(["Movies"]), FilterRules::new())
            .grant(
                "alice@example.com",
                DesiredLibraries::named(["TV Shows"]),
                FilterRules::new(),
            );
        let current = vec![grant("g1", "42", &["1"], GrantStatus::Active)];

        let plans = plan(&desired, &catalog(), &current, &directory());
        assert_eq!(plans.len(), 2);
        for plan in &plans {
            assert!(plan.revocations.is_empty());
            assert!(plan.step.is_none());
            assert_eq!(
                plan.settled,
                Some((
                    Action::Update,
                    Some(GrantId::from("g1")),
                    Outcome::Failed(ShareError::DuplicateAccount("42".to_string()))
                ))
            );
        }
    }

    #[test]
    fn report_summary_counts_actions() {
        let report = ReconcileReport {
            server_id: ServerId::from(SERVER),
            results: vec![
                AccountResult {
                    account: AccountRef::parse("1"),
                    action: Action::Create,
                    grant_id: None,
                    outcome: Outcome::Applied(GrantStatus::Pending),
                },
                AccountResult {
                    account: AccountRef::parse("2"),
                    action: Action::Noop,
                    grant_id: None,
                    outcome: Outcome::Unchanged,
                },
            ],
            warnings: Vec::new(),
        };
        assert!(report.converged());
        assert_eq!(
            report.to_string(),
            "server srv: 1 created, 0 updated, 0 revoked, 1 unchanged, 0 warnings"
        );
    }
}
