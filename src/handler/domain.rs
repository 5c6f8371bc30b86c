use chrono::Utc;
use tracing::{info, instrument};

use crate::dns::DomainVerification;
use crate::handler::{Handlers, repo_error};
use crate::models::{DomainId, DomainStatus};
use crate::queue::HandlerError;

impl Handlers {
    /// Check every DNS record a sending domain needs and update its
    /// status. Lookup failures mark individual records failed rather
    /// than erroring the task; DNS being DNS, the task is also retried
    /// on repository trouble only.
    #[instrument(skip(self), fields(domain_id = %domain_id))]
    pub(super) async fn handle_domain_verify(
        &self,
        domain_id: DomainId,
    ) -> Result<(), HandlerError> {
        let domain = self.domains.get(domain_id).await.map_err(repo_error)?;

        self.domains
            .update_status(domain.id, DomainStatus::Verifying)
            .await
            .map_err(repo_error)?;

        let verification = DomainVerification {
            timestamp: Utc::now(),
            mx: self.resolver.verify_mx(&domain.name).await,
            spf: self
                .resolver
                .verify_spf(&domain.name, &self.settings.spf_include)
                .await,
            dkim: self
                .resolver
                .verify_dkim(&domain.name, &domain.dkim_selector, &domain.dkim_public_key)
                .await,
            dmarc: self.resolver.verify_dmarc(&domain.name).await,
            return_path: self
                .resolver
                .verify_return_path(
                    &format!("bounce.{}", domain.name),
                    &self.settings.return_path_target,
                )
                .await,
        };

        let status = if verification.all_required_passed() {
            DomainStatus::Verified
        } else {
            DomainStatus::Failed
        };

        self.domains
            .save_verification(domain.id, status, &verification)
            .await
            .map_err(repo_error)?;

        info!(
            domain = domain.name,
            status = status.as_str(),
            "domain verification complete"
        );
        Ok(())
    }
}
