//! Shared state handed to every event handler and command.

use std::sync::Arc;
use std::time::Duration;

use cafe_core::ai::{Assistant, CompletionProvider, Moderator};
use cafe_core::config::BotConfig;
use cafe_core::keystore::Keystore;
use cafe_core::ledger::{CooldownLedger, DeletionLedger, ReferralLedger, RoleReactionLedger, XpLedger};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

/// Everything the bot knows, built once at startup.
pub struct BotContext {
    pub config: BotConfig,
    pub keystore: Arc<Keystore>,
    pub xp: XpLedger,
    pub cooldowns: CooldownLedger,
    pub referrals: ReferralLedger,
    pub role_reactions: RoleReactionLedger,
    pub deletions: DeletionLedger,
    pub moderator: Moderator,
    pub assistant: Assistant,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl BotContext {
    pub fn new(config: BotConfig, keystore: Arc<Keystore>, provider: Arc<dyn CompletionProvider>) -> Self {
        let cooldowns = CooldownLedger::new(Arc::clone(&keystore));
        let ai = &config.ai;
        let moderator = Moderator::new(
            Arc::clone(&provider),
            cooldowns.clone(),
            Duration::from_secs(ai.moderation_timeout_secs),
        );
        let assistant = Assistant::new(
            provider,
            Duration::from_secs(ai.answer_timeout_secs),
            Duration::from_secs(ai.generation_timeout_secs),
        );
        Self {
            xp: XpLedger::new(Arc::clone(&keystore)),
            referrals: ReferralLedger::new(Arc::clone(&keystore)),
            role_reactions: RoleReactionLedger::new(Arc::clone(&keystore)),
            deletions: DeletionLedger::new(Arc::clone(&keystore)),
            cooldowns,
            moderator,
            assistant,
            keystore,
            config,
            jobs: Mutex::new(Vec::new()),
        }
    }

    /// Track a background task so [`shutdown`](Self::shutdown) can stop it.
    pub fn register_job(&self, handle: JoinHandle<()>) {
        self.jobs.lock().push(handle);
    }

    pub fn has_jobs(&self) -> bool {
        !self.jobs.lock().is_empty()
    }

    /// Stop background jobs and flush the keystore.
    pub async fn shutdown(&self) {
        for job in self.jobs.lock().drain(..) {
            job.abort();
        }
        let report = self.keystore.shutdown().await;
        if !report.failed.is_empty() {
            tracing::warn!("Stores not flushed at shutdown: {:?}", report.failed);
        }
    }
}

impl std::fmt::Debug for BotContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BotContext")
            .field("keystore", &self.keystore)
            .field("jobs", &self.jobs.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cafe_core::test_utils::ScriptedProvider;

    #[tokio::test]
    async fn test_shutdown_aborts_jobs() {
        let keystore = Arc::new(Keystore::detached(Default::default()));
        let ctx = BotContext::new(BotConfig::default(), keystore, Arc::new(ScriptedProvider::new()));
        let job = tokio::spawn(std::future::pending::<()>());
        let abort = job.abort_handle();
        ctx.register_job(job);
        assert!(ctx.has_jobs());

        ctx.shutdown().await;
        assert!(!ctx.has_jobs());
        for _ in 0..10 {
            if abort.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(abort.is_finished());
    }
}
