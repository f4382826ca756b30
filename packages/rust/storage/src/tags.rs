//! Hierarchical tag taxonomy.
//!
//! Tags form a forest: each tag has at most one parent and the parent graph is
//! kept acyclic. Names are globally unique after trimming.

use std::collections::{HashSet, VecDeque};

use kbingest_shared::{IngestError, NewTag, Result, Tag, TagFilter, TagUpdate};
use libsql::params;
use uuid::Uuid;

use crate::{Storage, col_opt_string, col_string, db_err, now_rfc3339, parse_timestamp};

/// Upper bound on parent-chain walks; longer chains mean corrupted data.
pub const MAX_TAG_DEPTH: usize = 100;

const TAG_COLUMNS: &str = "id, name, parent_id, description, color, created_at";

/// CRUD and hierarchy queries over the `tags` table.
#[derive(Clone)]
pub struct TagManager {
    storage: Storage,
}

impl TagManager {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// Create a tag. The name is trimmed and must be unique; the parent, when
    /// given, must exist.
    pub async fn create_tag(&self, new: NewTag) -> Result<Tag> {
        self.storage.check_writable()?;
        let name = validate_name(&new.name)?;

        if self.get_tag_by_name(&name).await?.is_some() {
            return Err(IngestError::DuplicateName(name));
        }
        if let Some(parent_id) = new.parent_id.as_deref() {
            self.require_tag(parent_id).await?;
        }

        let id = Uuid::now_v7().to_string();
        let now = now_rfc3339();
        self.storage
            .conn()
            .execute(
                "INSERT INTO tags (id, name, parent_id, description, color, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id.as_str(),
                    name.as_str(),
                    new.parent_id.as_deref(),
                    new.description.as_deref(),
                    new.color.as_deref(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| {
                // Lost a race against a concurrent insert of the same name.
                if e.to_string().contains("UNIQUE") {
                    IngestError::DuplicateName(name.clone())
                } else {
                    db_err(e)
                }
            })?;

        tracing::debug!(tag_id = %id, name = %name, "created tag");
        self.require_tag(&id).await
    }

    pub async fn get_tag(&self, id: &str) -> Result<Option<Tag>> {
        let sql = format!("SELECT {TAG_COLUMNS} FROM tags WHERE id = ?1");
        self.query_one(&sql, params![id]).await
    }

    pub async fn get_tag_by_name(&self, name: &str) -> Result<Option<Tag>> {
        let sql = format!("SELECT {TAG_COLUMNS} FROM tags WHERE name = ?1");
        self.query_one(&sql, params![name.trim()]).await
    }

    /// Apply a partial update. Reparenting a tag onto itself or into its own
    /// subtree is rejected with [`IngestError::CircularReference`].
    pub async fn update_tag(&self, id: &str, update: TagUpdate) -> Result<Tag> {
        self.storage.check_writable()?;
        let mut tag = self.require_tag(id).await?;

        if let Some(name) = update.name.as_deref() {
            let name = validate_name(name)?;
            if !self.is_name_available(&name, Some(id)).await? {
                return Err(IngestError::DuplicateName(name));
            }
            tag.name = name;
        }

        if let Some(parent) = update.parent_id {
            if let Some(parent_id) = parent.as_deref() {
                self.require_tag(parent_id).await?;
                if parent_id == id || self.ancestor_ids(parent_id).await?.contains(id) {
                    return Err(IngestError::CircularReference {
                        tag_id: id.to_string(),
                        parent_id: parent_id.to_string(),
                    });
                }
            }
            tag.parent_id = parent;
        }
        if let Some(description) = update.description {
            tag.description = description;
        }
        if let Some(color) = update.color {
            tag.color = color;
        }

        self.storage
            .conn()
            .execute(
                "UPDATE tags SET name = ?1, parent_id = ?2, description = ?3, color = ?4
                 WHERE id = ?5",
                params![
                    tag.name.as_str(),
                    tag.parent_id.as_deref(),
                    tag.description.as_deref(),
                    tag.color.as_deref(),
                    id
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(tag)
    }

    /// Delete a tag inside a transaction.
    ///
    /// With `delete_children` the whole subtree goes; otherwise direct
    /// children are promoted to root tags first.
    pub async fn delete_tag(&self, id: &str, delete_children: bool) -> Result<()> {
        self.storage.check_writable()?;
        self.require_tag(id).await?;

        let doomed = if delete_children {
            let mut ids: Vec<String> = self
                .get_child_tags(id, true)
                .await?
                .into_iter()
                .map(|t| t.id)
                .collect();
            ids.push(id.to_string());
            ids
        } else {
            vec![id.to_string()]
        };

        let tx = self.storage.begin().await?;
        if !delete_children {
            tx.execute(
                "UPDATE tags SET parent_id = NULL WHERE parent_id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;
        }
        // Leaves first so no row ever points at a deleted parent.
        for tag_id in doomed.iter().rev() {
            tx.execute("DELETE FROM tags WHERE id = ?1", params![tag_id.as_str()])
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        tracing::debug!(tag_id = %id, removed = doomed.len(), "deleted tag");
        Ok(())
    }

    /// List tags, alphabetically.
    pub async fn list_tags(&self, filter: &TagFilter) -> Result<Vec<Tag>> {
        let (by_parent, parent) = match &filter.parent_id {
            None => (0i64, None),
            Some(parent) => (1i64, parent.as_deref()),
        };
        let sql = format!(
            "SELECT {TAG_COLUMNS} FROM tags
             WHERE (?1 = 0 OR parent_id IS ?2)
               AND (?3 IS NULL OR instr(lower(name), lower(?3)) > 0)
             ORDER BY name"
        );
        self.query_many(&sql, params![by_parent, parent, filter.search.as_deref()])
            .await
    }

    /// Children of `parent_id`; with `recursive`, the whole subtree in
    /// breadth-first order.
    pub async fn get_child_tags(&self, parent_id: &str, recursive: bool) -> Result<Vec<Tag>> {
        let sql = format!("SELECT {TAG_COLUMNS} FROM tags WHERE parent_id = ?1 ORDER BY name");
        if !recursive {
            return self.query_many(&sql, params![parent_id]).await;
        }

        let mut result = Vec::new();
        let mut visited: HashSet<String> = HashSet::from([parent_id.to_string()]);
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(parent_id.to_string(), 0)]);

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= MAX_TAG_DEPTH {
                return Err(IngestError::Corrupted(format!(
                    "tag hierarchy below {parent_id} exceeds depth {MAX_TAG_DEPTH}"
                )));
            }
            for child in self.query_many(&sql, params![current.as_str()]).await? {
                if visited.insert(child.id.clone()) {
                    queue.push_back((child.id.clone(), depth + 1));
                    result.push(child);
                }
            }
        }
        Ok(result)
    }

    /// Tags from the root down to `id` (inclusive).
    pub async fn get_tag_path(&self, id: &str) -> Result<Vec<Tag>> {
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut current = Some(id.to_string());

        while let Some(tag_id) = current {
            if !seen.insert(tag_id.clone()) || path.len() >= MAX_TAG_DEPTH {
                return Err(IngestError::Corrupted(format!(
                    "parent chain of tag {id} is cyclic or deeper than {MAX_TAG_DEPTH}"
                )));
            }
            let tag = self.require_tag(&tag_id).await?;
            current = tag.parent_id.clone();
            path.push(tag);
        }

        path.reverse();
        Ok(path)
    }

    /// Whether `name` (trimmed) is free, ignoring the tag `exclude_id`.
    pub async fn is_name_available(&self, name: &str, exclude_id: Option<&str>) -> Result<bool> {
        Ok(match self.get_tag_by_name(name).await? {
            None => true,
            Some(tag) => exclude_id == Some(tag.id.as_str()),
        })
    }

    /// Resolve tag names to ids, creating root tags for unknown names.
    /// Blank names are skipped; the result follows input order without repeats.
    pub async fn ensure_tags_exist(&self, names: &[String]) -> Result<Vec<String>> {
        let mut ids = Vec::with_capacity(names.len());
        for name in names {
            let name = name.trim();
            if name.is_empty() {
                continue;
            }
            let id = match self.get_tag_by_name(name).await? {
                Some(tag) => tag.id,
                None => match self.create_tag(NewTag::named(name)).await {
                    Ok(tag) => tag.id,
                    Err(IngestError::DuplicateName(_)) => self
                        .get_tag_by_name(name)
                        .await?
                        .ok_or_else(|| IngestError::not_found("tag", name))?
                        .id,
                    Err(e) => return Err(e),
                },
            };
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn require_tag(&self, id: &str) -> Result<Tag> {
        self.get_tag(id)
            .await?
            .ok_or_else(|| IngestError::not_found("tag", id))
    }

    /// Ids of every ancestor of `id` (excluding itself).
    async fn ancestor_ids(&self, id: &str) -> Result<HashSet<String>> {
        let mut ancestors = HashSet::new();
        let mut current = self.require_tag(id).await?.parent_id;
        while let Some(parent_id) = current {
            if !ancestors.insert(parent_id.clone()) || ancestors.len() > MAX_TAG_DEPTH {
                return Err(IngestError::Corrupted(format!(
                    "parent chain of tag {id} is cyclic or deeper than {MAX_TAG_DEPTH}"
                )));
            }
            current = self.require_tag(&parent_id).await?.parent_id;
        }
        Ok(ancestors)
    }

    async fn query_one(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Option<Tag>> {
        let mut rows = self
            .storage
            .conn()
            .query(sql, params)
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_tag(&row)?)),
            None => Ok(None),
        }
    }

    async fn query_many(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Tag>> {
        let mut rows = self
            .storage
            .conn()
            .query(sql, params)
            .await
            .map_err(db_err)?;
        let mut tags = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            tags.push(row_to_tag(&row)?);
        }
        Ok(tags)
    }
}

fn validate_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(IngestError::validation("tag name must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn row_to_tag(row: &libsql::Row) -> Result<Tag> {
    Ok(Tag {
        id: col_string(row, 0)?,
        name: col_string(row, 1)?,
        parent_id: col_opt_string(row, 2),
        description: col_opt_string(row, 3),
        color: col_opt_string(row, 4),
        created_at: parse_timestamp(&col_string(row, 5)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;

    async fn setup() -> TagManager {
        TagManager::new(test_storage().await)
    }

    #[tokio::test]
    async fn create_and_lookup() {
        let tags = setup().await;
        let tag = tags
            .create_tag(NewTag {
                name: "  rust  ".into(),
                description: Some("systems".into()),
                color: Some("#dea584".into()),
                parent_id: None,
            })
            .await
            .unwrap();
        assert_eq!(tag.name, "rust");
        assert_eq!(tags.get_tag(&tag.id).await.unwrap(), Some(tag.clone()));
        assert_eq!(
            tags.get_tag_by_name(" rust").await.unwrap().map(|t| t.id),
            Some(tag.id.clone())
        );

        let err = tags.create_tag(NewTag::named("rust")).await.unwrap_err();
        assert!(matches!(err, IngestError::DuplicateName(_)));

        let err = tags.create_tag(NewTag::named("   ")).await.unwrap_err();
        assert!(matches!(err, IngestError::Validation { .. }));

        let err = tags
            .create_tag(NewTag::named("orphan").with_parent("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::NotFound { .. }));
    }

    #[tokio::test]
    async fn reparenting_into_subtree_is_circular() {
        let tags = setup().await;
        let a = tags.create_tag(NewTag::named("a")).await.unwrap();
        let b = tags
            .create_tag(NewTag::named("b").with_parent(&a.id))
            .await
            .unwrap();
        let c = tags
            .create_tag(NewTag::named("c").with_parent(&b.id))
            .await
            .unwrap();

        let err = tags
            .update_tag(
                &a.id,
                TagUpdate {
                    parent_id: Some(Some(c.id.clone())),
                    ..TagUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::CircularReference { .. }));

        let err = tags
            .update_tag(
                &a.id,
                TagUpdate {
                    parent_id: Some(Some(a.id.clone())),
                    ..TagUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::CircularReference { .. }));

        // Moving a leaf to the root is fine.
        let moved = tags
            .update_tag(
                &c.id,
                TagUpdate {
                    parent_id: Some(None),
                    ..TagUpdate::default()
                },
            )
            .await
            .unwrap();
        assert!(moved.parent_id.is_none());
    }

    #[tokio::test]
    async fn rename_respects_uniqueness() {
        let tags = setup().await;
        let a = tags.create_tag(NewTag::named("a")).await.unwrap();
        tags.create_tag(NewTag::named("b")).await.unwrap();

        let err = tags
            .update_tag(
                &a.id,
                TagUpdate {
                    name: Some("b".into()),
                    ..TagUpdate::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::DuplicateName(_)));

        assert!(tags.is_name_available("a", Some(&a.id)).await.unwrap());
        assert!(!tags.is_name_available("a", None).await.unwrap());
        let renamed = tags
            .update_tag(
                &a.id,
                TagUpdate {
                    name: Some("alpha".into()),
                    ..TagUpdate::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(renamed.name, "alpha");
    }

    #[tokio::test]
    async fn delete_promotes_children() {
        let tags = setup().await;
        let a = tags.create_tag(NewTag::named("a")).await.unwrap();
        let b = tags
            .create_tag(NewTag::named("b").with_parent(&a.id))
            .await
            .unwrap();
        let c = tags
            .create_tag(NewTag::named("c").with_parent(&b.id))
            .await
            .unwrap();

        tags.delete_tag(&a.id, false).await.unwrap();
        assert!(tags.get_tag(&a.id).await.unwrap().is_none());
        let b = tags.get_tag(&b.id).await.unwrap().unwrap();
        assert!(b.parent_id.is_none());
        let c = tags.get_tag(&c.id).await.unwrap().unwrap();
        assert_eq!(c.parent_id.as_deref(), Some(b.id.as_str()));
    }

    #[tokio::test]
    async fn delete_cascades_to_descendants() {
        let tags = setup().await;
        let a = tags.create_tag(NewTag::named("a")).await.unwrap();
        let b = tags
            .create_tag(NewTag::named("b").with_parent(&a.id))
            .await
            .unwrap();
        tags.create_tag(NewTag::named("c").with_parent(&b.id))
            .await
            .unwrap();
        let other = tags.create_tag(NewTag::named("other")).await.unwrap();

        tags.delete_tag(&a.id, true).await.unwrap();
        let remaining = tags.list_tags(&TagFilter::default()).await.unwrap();
        assert_eq!(remaining, vec![other]);
    }

    #[tokio::test]
    async fn hierarchy_queries() {
        let tags = setup().await;
        let lang = tags.create_tag(NewTag::named("lang")).await.unwrap();
        let rust = tags
            .create_tag(NewTag::named("rust").with_parent(&lang.id))
            .await
            .unwrap();
        let tokio = tags
            .create_tag(NewTag::named("tokio").with_parent(&rust.id))
            .await
            .unwrap();
        tags.create_tag(NewTag::named("go").with_parent(&lang.id))
            .await
            .unwrap();

        let direct = tags.get_child_tags(&lang.id, false).await.unwrap();
        assert_eq!(
            direct.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["go", "rust"]
        );
        let all = tags.get_child_tags(&lang.id, true).await.unwrap();
        assert_eq!(all.len(), 3);

        let path = tags.get_tag_path(&tokio.id).await.unwrap();
        assert_eq!(
            path.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["lang", "rust", "tokio"]
        );

        let roots = tags
            .list_tags(&TagFilter {
                parent_id: Some(None),
                ..TagFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(roots, vec![lang.clone()]);

        let children = tags
            .list_tags(&TagFilter {
                parent_id: Some(Some(lang.id.clone())),
                search: Some("RU".into()),
            })
            .await
            .unwrap();
        assert_eq!(children, vec![rust]);
    }

    #[tokio::test]
    async fn ensure_tags_is_idempotent() {
        let tags = setup().await;
        let existing = tags.create_tag(NewTag::named("docs")).await.unwrap();

        let names = vec![
            "docs".to_string(),
            " new ".to_string(),
            "".to_string(),
            "new".to_string(),
        ];
        let ids = tags.ensure_tags_exist(&names).await.unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], existing.id);

        let again = tags.ensure_tags_exist(&names).await.unwrap();
        assert_eq!(ids, again);
    }
}
