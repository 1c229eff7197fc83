//! Review engine
//!
//! Wires the format adapter, session cache, render pipeline, pagination,
//! classification and mask editor into the six detection operations. Every
//! operation takes the caller's identity; a session that exists but belongs
//! to someone else is reported exactly like a missing one.

use std::path::PathBuf;
use std::sync::Arc;

use eht_common::{Error, Result};
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::cache::{SessionCache, SharedVolume};
use crate::classification::{Classification, DetectionStats};
use crate::config::Config;
use crate::db;
use crate::format::{load_volume, save_mask_layer, validate_dataset_path, DatasetInfo};
use crate::mask::prepare_edit;
use crate::models::{
    ClassifyRequest, ClassifyResponse, DetectionSession, LayerInfo, LayersPage, LayersQuery,
    LoadRequest, LoadResponse, MessageResponse, NewSession, SaveMaskRequest,
};
use crate::pagination::{calculate_pagination, validate_page_size, DEFAULT_PAGE_SIZE};
use crate::render::{render_layer, Clahe, RenderedLayer};
use crate::volume::Volume;

/// Tunables of the review workflow
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewOptions {
    pub clahe: Clahe,
    pub enhance_by_default: bool,
    pub default_page_size: i64,
    pub max_page_size: i64,
    /// Root that relative dataset paths must stay under
    pub uploads_dir: PathBuf,
}

impl Default for ReviewOptions {
    fn default() -> Self {
        Self {
            clahe: Clahe::default(),
            enhance_by_default: true,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: 200,
            uploads_dir: PathBuf::from("uploads"),
        }
    }
}

impl ReviewOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            clahe: Clahe::new(config.render.clahe_clip_limit, config.render.clahe_tiles),
            enhance_by_default: config.render.enhance_by_default,
            default_page_size: config.render.default_page_size,
            max_page_size: config.render.max_page_size,
            uploads_dir: config.uploads_dir.clone(),
        }
    }
}

/// Run CPU- or file-bound work off the async workers
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("Blocking task failed: {}", e)))?
}

fn session_not_found() -> Error {
    Error::NotFound("Session not found".to_string())
}

/// The detection review engine
///
/// Cheap to clone: the pool, cache and options are shared.
#[derive(Clone)]
pub struct ReviewEngine {
    pool: SqlitePool,
    cache: Arc<SessionCache>,
    options: Arc<ReviewOptions>,
}

impl ReviewEngine {
    pub fn new(pool: SqlitePool, cache: Arc<SessionCache>, options: ReviewOptions) -> Self {
        Self {
            pool,
            cache,
            options: Arc::new(options),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<SessionCache> {
        &self.cache
    }

    async fn owned_session(&self, session_id: i64, owner_id: i64) -> Result<DetectionSession> {
        db::get_owned_session(&self.pool, session_id, owner_id)
            .await?
            .ok_or_else(session_not_found)
    }

    /// Cached volume for a session, rebuilt from its stored paths on a miss
    ///
    /// The rebuild runs under the session gate and first confirms the
    /// session still exists, so a delete that won the gate is never undone.
    /// A rebuilt volume whose layer count differs from the persisted
    /// `total_layers` is rejected and left uncached.
    async fn session_volume(&self, session: &DetectionSession) -> Result<SharedVolume> {
        let session_id = session.id;
        let owner_id = session.user_id;
        let expected = session.total_layers;
        let dataset_path = session.dataset_path.clone();
        let mask_path = session.mask_path.clone();
        let pool = self.pool.clone();

        self.cache
            .materialize(session_id, move || async move {
                if db::get_owned_session(&pool, session_id, owner_id).await?.is_none() {
                    debug!(session_id, "Session deleted while waiting to rebuild");
                    return Err(session_not_found());
                }

                let volume = blocking(move || {
                    load_volume(&dataset_path, mask_path.as_deref()).map_err(Error::from)
                })
                .await
                .map_err(|e| {
                    error!(session_id, error = %e, "Failed to reload session data");
                    e
                })?;

                let found = volume.num_slices() as i64;
                if found != expected {
                    error!(session_id, expected, found, "Rebuilt volume disagrees with session");
                    return Err(Error::Internal(format!(
                        "Session {} consistency fault: dataset now has {} layers, session records {}",
                        session_id, found, expected
                    )));
                }
                Ok(volume)
            })
            .await
    }

    /// Load a dataset (and optional mask) and create a session for it
    pub async fn load_dataset(&self, owner_id: i64, request: LoadRequest) -> Result<LoadResponse> {
        let uploads_dir = &self.options.uploads_dir;
        let dataset_path = validate_dataset_path(&request.dataset_path, uploads_dir)?;
        let mask_path = request
            .mask_path
            .as_deref()
            .map(|p| validate_dataset_path(p, uploads_dir))
            .transpose()?;

        let volume: Volume = {
            let dataset_path = dataset_path.clone();
            let mask_path = mask_path.clone();
            blocking(move || load_volume(&dataset_path, mask_path.as_deref()).map_err(Error::from))
                .await?
        };

        let info = DatasetInfo::of(&volume);
        let layer_names: Vec<String> = (0..info.total_layers).map(|i| volume.layer_name(i)).collect();

        let session_id = db::create_session(
            &self.pool,
            &NewSession {
                user_id: owner_id,
                project_name: request.project_name.clone(),
                dataset_path: dataset_path.clone(),
                mask_path,
            },
            &layer_names,
        )
        .await?;

        self.cache.insert(session_id, volume).await;

        info!(
            session_id,
            owner_id,
            dataset = %dataset_path,
            total_layers = info.total_layers,
            has_masks = info.has_masks,
            "Loaded detection dataset"
        );

        Ok(LoadResponse {
            session_id,
            total_layers: info.total_layers as i64,
            project_name: request.project_name,
            is_3d: info.is_3d,
            image_shape: [info.image_shape.0, info.image_shape.1],
            has_masks: info.has_masks,
        })
    }

    /// One page of layers in index order, optionally rendered
    ///
    /// A layer that fails to render is returned without payloads rather than
    /// failing the page.
    pub async fn get_layers(&self, owner_id: i64, query: &LayersQuery) -> Result<LayersPage> {
        let session = self.owned_session(query.session_id, owner_id).await?;

        let page_size = query.page_size.unwrap_or(self.options.default_page_size);
        validate_page_size(page_size, self.options.max_page_size)?;
        let pagination = calculate_pagination(session.total_layers, query.page, page_size)?;

        let records = db::list_layers_in_range(
            &self.pool,
            session.id,
            pagination.start_index,
            pagination.end_index,
        )
        .await?;

        let mut rendered: Vec<Option<RenderedLayer>> = vec![None; records.len()];
        if query.include_images {
            let volume = self.session_volume(&session).await?;
            let enhance = query.enhance.unwrap_or(self.options.enhance_by_default);
            let clahe = self.options.clahe;
            let session_id = session.id;
            let indices: Vec<i64> = records.iter().map(|layer| layer.layer_index).collect();

            rendered = blocking(move || {
                let volume = volume.blocking_read();
                Ok(indices
                    .into_iter()
                    .map(|index| {
                        match render_layer(&volume, index as usize, enhance, &clahe) {
                            Ok(layer) => Some(layer),
                            Err(e) => {
                                warn!(session_id, layer_index = index, error = %e, "Failed to render layer");
                                None
                            }
                        }
                    })
                    .collect())
            })
            .await?;
        }

        let layers = records
            .into_iter()
            .zip(rendered)
            .map(|(record, rendered)| {
                let (image, mask) = match rendered {
                    Some(layer) => (Some(layer.image), layer.mask),
                    None => (None, None),
                };
                LayerInfo {
                    id: record.id,
                    layer_index: record.layer_index,
                    layer_name: record.layer_name,
                    classification: record.classification,
                    image_base64: image,
                    mask_base64: mask,
                }
            })
            .collect();

        Ok(LayersPage {
            layers,
            total: session.total_layers,
            page: pagination.page,
            page_size: pagination.page_size,
            total_pages: pagination.total_pages,
        })
    }

    /// Set the classification of the listed layers of one session
    pub async fn classify_layers(
        &self,
        owner_id: i64,
        request: ClassifyRequest,
    ) -> Result<ClassifyResponse> {
        let session = self.owned_session(request.session_id, owner_id).await?;
        let classification: Classification = request.classification.parse()?;

        let updated_count = {
            let _gate = self.cache.lock(session.id).await;
            self.owned_session(session.id, owner_id).await?;
            db::classify_layers(&self.pool, session.id, &request.layer_ids, classification).await?
        };

        info!(
            session_id = session.id,
            requested = request.layer_ids.len(),
            updated_count,
            classification = %classification,
            "Classified layers"
        );

        Ok(ClassifyResponse {
            updated_count,
            message: format!(
                "Classified {} layer(s) as '{}'",
                updated_count, classification
            ),
        })
    }

    /// Classification counts and review progress
    pub async fn get_stats(&self, owner_id: i64, session_id: i64) -> Result<DetectionStats> {
        let session = self.owned_session(session_id, owner_id).await?;
        let counts = db::count_by_classification(&self.pool, session.id).await?;
        Ok(DetectionStats::from_counts(counts))
    }

    /// Replace one mask layer in memory and write it through to disk
    ///
    /// If the disk write fails the in-memory layer is put back, so the cache
    /// never runs ahead of the stored mask.
    pub async fn save_mask(&self, owner_id: i64, request: SaveMaskRequest) -> Result<MessageResponse> {
        let session = self.owned_session(request.session_id, owner_id).await?;
        let layer_index = usize::try_from(request.layer_index).map_err(|_| {
            Error::InvalidInput(format!(
                "Layer index {} out of range [0, {})",
                request.layer_index, session.total_layers
            ))
        })?;

        let volume = self.session_volume(&session).await?;
        let _gate = self.cache.lock(session.id).await;
        // A delete may have run while this call waited on the gate
        self.owned_session(session.id, owner_id).await?;

        let mask_path = session.mask_path.clone();
        let encoded = request.mask_base64;
        blocking(move || {
            let mut volume = volume.blocking_write();
            let mask = prepare_edit(&volume, layer_index, &encoded)?;
            let previous = volume.mask(layer_index)?;
            volume.replace_mask(layer_index, &mask)?;

            let (Some(path), Some(masks)) = (mask_path.as_deref(), volume.masks()) else {
                return Ok(());
            };
            if let Err(e) = save_mask_layer(path, masks, layer_index) {
                if let Some(previous) = previous {
                    volume.restore_mask(layer_index, &previous)?;
                }
                return Err(Error::from(e));
            }
            Ok(())
        })
        .await?;

        db::touch_session(&self.pool, session.id).await?;
        info!(session_id = session.id, layer_index, "Saved mask layer");

        Ok(MessageResponse {
            message: format!("Mask saved for layer {}", layer_index),
        })
    }

    /// Delete a session, its layers and its cached volume
    pub async fn delete_session(&self, owner_id: i64, session_id: i64) -> Result<MessageResponse> {
        let session = self.owned_session(session_id, owner_id).await?;

        {
            let _gate = self.cache.lock(session.id).await;
            self.owned_session(session.id, owner_id).await?;
            self.cache.evict(session.id).await;
            db::delete_session(&self.pool, session.id).await?;
        }
        self.cache.release_gate(session.id).await;

        info!(session_id, owner_id, "Deleted detection session");
        Ok(MessageResponse {
            message: format!("Session {} deleted successfully", session_id),
        })
    }

    /// Number of sessions with a decoded volume in memory
    pub async fn cached_sessions(&self) -> usize {
        self.cache.len().await
    }
}
