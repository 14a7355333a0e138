//! Offset pagination over legacy tables.

use db::{
    PageRequest, Row, StoreError, StoreReader,
    models::{Entity, Table},
};

/// Read one page of `entity`'s legacy rows in stable `(created_at, id)` order.
pub async fn read_page<R>(
    reader: &R,
    entity: Entity,
    offset: u64,
    page_size: u64,
) -> Result<Vec<Row>, StoreError>
where
    R: StoreReader + ?Sized,
{
    let table = Table::Legacy(entity);
    reader
        .fetch_page(table, PageRequest::for_table(table, offset, page_size))
        .await
}

/// Position of the batch processor within one entity.
///
/// Bounded by the row count taken when the entity started, so rows inserted
/// into the source mid-run are never read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchCursor {
    entity: Entity,
    batch_size: u64,
    limit: u64,
    offset: u64,
}

impl BatchCursor {
    pub fn new(entity: Entity, batch_size: u64, limit: u64, offset: u64) -> Self {
        Self {
            entity,
            batch_size: batch_size.max(1),
            limit,
            offset,
        }
    }

    pub fn entity(&self) -> Entity {
        self.entity
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.limit
    }

    /// `(offset, size)` of the next page, `None` once the limit is reached.
    pub fn next_page(&self) -> Option<(u64, u64)> {
        if self.is_exhausted() {
            return None;
        }
        Some((self.offset, self.batch_size.min(self.limit - self.offset)))
    }

    pub fn advance(&mut self, rows: u64) {
        self.offset += rows;
    }

    /// Fetch the next page and advance past it.
    pub async fn next_batch<R>(&mut self, reader: &R) -> Result<Option<Vec<Row>>, StoreError>
    where
        R: StoreReader + ?Sized,
    {
        let Some((offset, size)) = self.next_page() else {
            return Ok(None);
        };
        let rows = read_page(reader, self.entity, offset, size).await?;
        self.advance(rows.len() as u64);
        Ok(Some(rows))
    }
}

#[cfg(test)]
mod tests {
    use db::MemoryStore;
    use serde_json::json;

    use super::*;

    fn legacy_customer(id: i64, created_at: &str) -> Row {
        json!({"id": id, "customer_code": format!("C{id}"), "name": "n", "created_at": created_at})
            .as_object()
            .unwrap()
            .clone()
    }

    #[test]
    fn test_pages_stop_at_limit() {
        let mut cursor = BatchCursor::new(Entity::Customers, 1000, 2500, 0);
        let mut pages = Vec::new();
        while let Some((offset, size)) = cursor.next_page() {
            pages.push((offset, size));
            cursor.advance(size);
        }
        assert_eq!(pages, vec![(0, 1000), (1000, 1000), (2000, 500)]);
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_resume_from_offset() {
        let cursor = BatchCursor::new(Entity::Customers, 100, 250, 200);
        assert_eq!(cursor.next_page(), Some((200, 50)));
    }

    #[tokio::test]
    async fn test_read_page_orders_by_created_then_id() {
        let store = MemoryStore::with_legacy_schema();
        store.seed(
            Table::Legacy(Entity::Customers),
            [
                legacy_customer(3, "2024-01-02T00:00:00Z"),
                legacy_customer(2, "2024-01-01T00:00:00Z"),
                legacy_customer(1, "2024-01-02T00:00:00Z"),
            ],
        );

        let rows = read_page(&store, Entity::Customers, 0, 10).await.unwrap();
        let ids: Vec<i64> = rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![2, 1, 3]);

        let mut cursor = BatchCursor::new(Entity::Customers, 2, 3, 0);
        let first = cursor.next_batch(&store).await.unwrap().unwrap();
        let second = cursor.next_batch(&store).await.unwrap().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(cursor.next_batch(&store).await.unwrap().is_none());
    }
}
