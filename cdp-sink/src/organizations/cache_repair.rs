//! Batch repair of the legacy organization cache
//!
//! Older ingestion paths created several cache rows for one website. The
//! repair keeps the most complete row, copies over whatever it lacks from
//! the others, re-points links and deletes the duplicates.

use sqlx::SqlitePool;

use crate::db::organizations as repo;
use crate::error::{ResultExt, SinkResult};

/// Merge duplicate cache rows, `batch` websites at a time
///
/// Returns the number of rows deleted.
pub async fn repair_organization_cache(pool: &SqlitePool, batch: i64) -> SinkResult<usize> {
    let mut removed = 0;

    loop {
        let websites = repo::duplicate_cache_websites(pool, batch.max(1)).await?;
        if websites.is_empty() {
            break;
        }

        for website in &websites {
            let mut tx = pool.begin().await?;

            let mut rows = repo::cache_rows_for_website(&mut *tx, website).await?;
            if rows.len() < 2 {
                continue;
            }

            // most complete row wins, oldest first on ties
            let canonical_idx = rows
                .iter()
                .enumerate()
                .max_by(|(ia, a), (ib, b)| {
                    a.non_null_count()
                        .cmp(&b.non_null_count())
                        .then(ib.cmp(ia))
                })
                .map(|(idx, _)| idx)
                .unwrap_or(0);
            let mut canonical = rows.swap_remove(canonical_idx);

            for duplicate in &rows {
                canonical.fields.fill_missing(&duplicate.fields);
                if canonical.name.is_none() {
                    canonical.name = duplicate.name.clone();
                }
                repo::move_cache_links(&mut *tx, duplicate.id, canonical.id).await?;
                repo::delete_cache_row(&mut *tx, duplicate.id).await?;
            }
            repo::update_cache_row(&mut *tx, &canonical).await?;

            tx.commit()
                .await
                .context(format!("committing cache repair for {}", website))?;

            tracing::info!(
                website = %website,
                canonical_id = %canonical.id,
                duplicates = rows.len(),
                "Merged duplicate organization cache rows"
            );
            removed += rows.len();
        }
    }

    Ok(removed)
}
