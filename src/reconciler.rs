use thiserror::Error;
use tracing::{debug, info};

use crate::{
    image::{ImageRef, parse_image_reference},
    ledger::{Ledger, LedgerError},
    model::UpdatedApplication,
    workload::{SourceError, WorkloadSource},
};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Records the versions currently deployed in `context` and returns the applications whose
/// version changed.
///
/// Nothing is written when the workloads can't be listed. Workloads without an image or with
/// an image that has no tag are skipped.
#[tracing::instrument(skip(source, ledger))]
pub async fn reconcile(
    source: &dyn WorkloadSource,
    ledger: &Ledger,
    context: &str,
) -> Result<Vec<UpdatedApplication>, ReconcileError> {
    let workloads = source.list_workloads(context).await?;

    ledger.ensure_context(context).await?;

    let mut updated = Vec::new();
    for workload in workloads {
        let Some(image) = workload.image.as_deref() else {
            debug!(
                kind = %workload.kind,
                namespace = %workload.namespace,
                name = %workload.name,
                "Workload has no image, skipping"
            );
            continue;
        };

        let ImageRef::Parsed {
            application,
            version,
        } = parse_image_reference(image)
        else {
            debug!(
                kind = %workload.kind,
                namespace = %workload.namespace,
                name = %workload.name,
                image,
                "Image has no tag, skipping"
            );
            continue;
        };

        ledger.ensure_application(&application).await?;

        if ledger
            .append_if_changed(&application, context, &version)
            .await?
        {
            info!(%application, %version, "Recorded new version");
            updated.push(UpdatedApplication {
                application,
                version,
            });
        }
    }

    info!(updated = updated.len(), "Reconciliation finished");

    Ok(updated)
}
