use crate::{
    error::CatalogError,
    models::{common::IAPPlatform, product::ProductDefinition},
};
use std::collections::HashMap;
use tracing::debug;
use validator::Validate;

/// In-memory registry of purchasable products
#[derive(Debug, Default, Clone)]
pub struct Catalog {
    products: HashMap<String, ProductDefinition>,
    // (platform, store id) -> catalog id
    store_index: HashMap<(IAPPlatform, String), String>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog, failing on the first invalid or duplicate definition
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = ProductDefinition>,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self::new();
        for definition in definitions {
            catalog.register(definition)?;
        }
        Ok(catalog)
    }

    pub fn register(&mut self, definition: ProductDefinition) -> Result<(), CatalogError> {
        definition
            .validate()
            .map_err(|e| CatalogError::InvalidDefinition {
                id: definition.id.clone(),
                reason: e.to_string(),
            })?;

        if self.products.contains_key(&definition.id) {
            return Err(CatalogError::DuplicateProduct(definition.id));
        }

        for (platform, store_id) in &definition.platform_ids {
            if let Some(existing) = self.store_index.get(&(*platform, store_id.clone())) {
                return Err(CatalogError::DuplicateStoreId {
                    platform: *platform,
                    store_id: store_id.clone(),
                    existing: existing.clone(),
                });
            }
            // Another product still answers to its catalog id on this platform
            if let Some(existing) = self.products.get(store_id) {
                if existing.id != definition.id && !existing.platform_ids.contains_key(platform) {
                    return Err(CatalogError::DuplicateStoreId {
                        platform: *platform,
                        store_id: store_id.clone(),
                        existing: existing.id.clone(),
                    });
                }
            }
        }

        // Our catalog id is already some other product's override where we have none
        if let Some(((platform, store_id), existing)) = self
            .store_index
            .iter()
            .find(|((platform, store_id), _)| {
                *store_id == definition.id && !definition.platform_ids.contains_key(platform)
            })
        {
            return Err(CatalogError::DuplicateStoreId {
                platform: *platform,
                store_id: store_id.clone(),
                existing: existing.clone(),
            });
        }

        for (platform, store_id) in &definition.platform_ids {
            self.store_index
                .insert((*platform, store_id.clone()), definition.id.clone());
        }

        debug!(product_id = %definition.id, kind = definition.kind.as_str(), "Registered product");
        self.products.insert(definition.id.clone(), definition);
        Ok(())
    }

    pub fn lookup(&self, id: &str) -> Result<&ProductDefinition, CatalogError> {
        self.products
            .get(id)
            .ok_or_else(|| CatalogError::UnknownProduct(id.to_string()))
    }

    /// Map a store-specific id back to its catalog product.
    ///
    /// Products without an override on `platform` are known by their catalog id.
    pub fn resolve_store_id(
        &self,
        platform: IAPPlatform,
        store_id: &str,
    ) -> Result<&ProductDefinition, CatalogError> {
        if let Some(id) = self.store_index.get(&(platform, store_id.to_string())) {
            return self.lookup(id);
        }

        match self.products.get(store_id) {
            Some(product) if !product.platform_ids.contains_key(&platform) => Ok(product),
            _ => Err(CatalogError::UnknownProduct(store_id.to_string())),
        }
    }

    pub fn products(&self) -> impl Iterator<Item = &ProductDefinition> {
        self.products.values()
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}
