use futures::{stream, StreamExt};

use crate::{err::EngineError, registry::LanguageRegistry};

use super::engine::ContainerEngine;

/// Pull every image referenced by `registry` that the engine does not have
/// yet, a few at a time.
///
/// Failures do not stop the remaining pulls. Returns the images that could
/// not be made available, with the reason.
pub async fn prepare_images(
    engine: &dyn ContainerEngine,
    registry: &LanguageRegistry,
) -> Vec<(String, EngineError)> {
    let mut images: Vec<String> = registry.profiles().iter().map(|p| p.image.clone()).collect();
    images.sort();
    images.dedup();

    stream::iter(images)
        .map(|image| async move {
            tracing::debug!(%image, "Preparing image");
            match engine.ensure_image(&image).await {
                Ok(()) => None,
                Err(e) => {
                    tracing::error!(%image, "Failed to prepare image: {}", e);
                    Some((image, e))
                }
            }
        })
        .buffer_unordered(4)
        .filter_map(futures::future::ready)
        .collect()
        .await
}
