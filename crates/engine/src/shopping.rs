use std::collections::BTreeMap;

use pantry_core::merge::{
    TagOutcome, format_amount, is_valid_tag, merge_quantities, merge_tag_sets, parse_quantity,
    scale_quantity,
};
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use pantry_core::{
    BatchOp, CollectionKey, DecimalStyle, Entity, EntityId, FieldValue, Mutation, MutationKind,
    Patch,
};

use crate::config::EngineConfig;
use crate::error::MutationError;
use crate::executor::{Executor, MutationHandle};

pub const NAME: &str = "name";
pub const NAME_KEY: &str = "nameKey";
pub const QTY: &str = "qty";
pub const SIZE: &str = "size";
pub const CHECKED: &str = "checked";
pub const CHECKED_AT: &str = "checkedAt";
pub const QTY_BEFORE_CHECK: &str = "qtyBeforeCheck";
pub const ADDED_TO_SHOPPING_AT: &str = "addedToShoppingAt";
pub const CREATED_AT: &str = "createdAt";

pub const NAME_LOWER: &str = "nameLower";
pub const BASE_PORTIONS: &str = "basePortions";
pub const LEGACY_PORTIONS: &str = "portions";
pub const TAGS: &str = "tags";
pub const INGREDIENTS: &str = "ingredients";
pub const STEPS: &str = "steps";
pub const DESC: &str = "desc";

pub const NO_HOUSEHOLD: &str = "Set household in Options";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingredient {
    pub name: String,
    pub qty: String,
}

impl Ingredient {
    pub fn new(name: &str, qty: &str) -> Self {
        Self {
            name: name.to_string(),
            qty: qty.to_string(),
        }
    }

    fn to_value(&self) -> FieldValue {
        let mut map = BTreeMap::new();
        map.insert(NAME.to_string(), FieldValue::from(self.name.trim()));
        map.insert(QTY.to_string(), FieldValue::from(self.qty.trim()));
        FieldValue::Map(map)
    }
}

/// Editor contents of a recipe. `id: None` creates a new recipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecipeDraft {
    pub id: Option<EntityId>,
    pub name: String,
    pub base_portions: u32,
    pub tags: Vec<String>,
    pub ingredients: Vec<Ingredient>,
    pub steps: Vec<String>,
    pub desc: Option<String>,
}

/// Lookup key for item names: trimmed, accents stripped, lowercased.
pub fn name_key(name: &str) -> String {
    name.trim()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Ingredients of a recipe entity, skipping rows without a name.
pub fn recipe_ingredients(recipe: &Entity) -> Vec<Ingredient> {
    let Some(rows) = recipe.get(INGREDIENTS).and_then(FieldValue::as_list) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(FieldValue::as_map)
        .filter_map(|row| {
            let name = row.get(NAME).and_then(FieldValue::as_text)?.trim();
            if name.is_empty() {
                return None;
            }
            let qty = row.get(QTY).and_then(FieldValue::as_text).unwrap_or("").trim();
            Some(Ingredient::new(name, qty))
        })
        .collect()
}

/// Portions a recipe is written for; never below one.
pub fn base_portions(recipe: &Entity) -> f64 {
    let value = recipe
        .get(BASE_PORTIONS)
        .or_else(|| recipe.get(LEGACY_PORTIONS));
    let portions = match value {
        Some(FieldValue::Text(text)) => parse_quantity(text).map(|q| q.amount),
        Some(other) => other.as_number(),
        None => None,
    };
    portions.filter(|p| p.is_finite()).unwrap_or(1.0).max(1.0)
}

pub fn recipe_tags(recipe: &Entity) -> Vec<String> {
    recipe
        .get(TAGS)
        .and_then(FieldValue::as_list)
        .map(|tags| {
            tags.iter()
                .filter_map(FieldValue::as_text)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Patch that unchecks an item and puts back the quantity it had when checked.
pub fn uncheck_patch(item: &Entity) -> Patch {
    let restored = item
        .text(QTY_BEFORE_CHECK)
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .or_else(|| item.text(QTY))
        .unwrap_or("")
        .to_string();
    Patch::new()
        .set(CHECKED, false)
        .set(QTY, restored)
        .set(CHECKED_AT, FieldValue::Null)
        .delete(QTY_BEFORE_CHECK)
        .touched()
}

/// Back on the list: unchecked, checked-state cleared, re-stamped.
fn relist(patch: Patch) -> Patch {
    patch
        .set(CHECKED, false)
        .set(CHECKED_AT, FieldValue::Null)
        .delete(QTY_BEFORE_CHECK)
        .server_timestamp(ADDED_TO_SHOPPING_AT)
        .touched()
}

/// One list entry produced by adding a recipe.
struct PlannedItem {
    key: String,
    id: EntityId,
    name: String,
    qty: String,
    is_new: bool,
}

fn plan_ops(items: &CollectionKey, plan: Vec<PlannedItem>) -> Vec<BatchOp> {
    plan.into_iter()
        .map(|item| {
            let patch = if item.is_new {
                new_item_patch(&item.name, &item.qty)
            } else {
                relist(Patch::new().set(QTY, item.qty))
            };
            BatchOp::set(items, &item.id, patch)
        })
        .collect()
}

/// Quantity a weekly staple adds to the list; one unless it holds a positive number.
fn weekly_qty(staple: &Entity) -> f64 {
    let qty = match staple.get(QTY) {
        Some(FieldValue::Text(text)) => parse_quantity(text)
            .filter(|q| q.tail.is_empty())
            .map(|q| q.amount),
        Some(other) => other.as_number(),
        None => None,
    };
    qty.filter(|q| q.is_finite() && *q > 0.0).unwrap_or(1.0)
}

fn new_item_patch(name: &str, qty: &str) -> Patch {
    Patch::new()
        .set(NAME, name)
        .set(NAME_KEY, name_key(name))
        .set(QTY, qty)
        .set(SIZE, "")
        .set(CHECKED, false)
        .server_timestamp(CREATED_AT)
        .touched()
}

/// Shopping list and recipe operations for one household.
#[derive(Clone)]
pub struct ShoppingList {
    executor: Executor,
    household: String,
    decimal_style: DecimalStyle,
    max_tags: usize,
}

impl ShoppingList {
    pub fn new(executor: Executor, household: &str, config: &EngineConfig) -> Self {
        Self {
            executor,
            household: household.trim().to_string(),
            decimal_style: config.decimal_style,
            max_tags: config.max_tags_per_recipe,
        }
    }

    pub fn household(&self) -> &str {
        &self.household
    }

    pub fn items(&self) -> CollectionKey {
        CollectionKey::items(&self.household)
    }

    pub fn weekly(&self) -> CollectionKey {
        CollectionKey::weekly(&self.household)
    }

    pub fn recipes(&self) -> CollectionKey {
        CollectionKey::recipes(&self.household)
    }

    fn invalid(
        &self,
        kind: MutationKind,
        collection: &CollectionKey,
        entity_id: Option<&EntityId>,
        reason: &str,
    ) -> MutationError {
        self.executor.reject(
            kind,
            Some(collection),
            entity_id,
            MutationError::Validation(reason.to_string()),
        )
    }

    /// Every operation needs a household to address its collections.
    fn require_household(&self, kind: MutationKind) -> Result<(), MutationError> {
        if !self.household.is_empty() {
            return Ok(());
        }
        Err(self.executor.reject(
            kind,
            None,
            None,
            MutationError::Validation(NO_HOUSEHOLD.to_string()),
        ))
    }

    fn item(&self, id: &EntityId) -> Result<Entity, MutationError> {
        let items = self.items();
        self.executor
            .store()
            .entity(&items, id)
            .ok_or_else(|| self.invalid(MutationKind::Update, &items, Some(id), "Item not found"))
    }

    fn recipe(&self, id: &EntityId) -> Result<Entity, MutationError> {
        let recipes = self.recipes();
        self.executor
            .store()
            .entity(&recipes, id)
            .ok_or_else(|| self.invalid(MutationKind::Update, &recipes, Some(id), "Recipe not found"))
    }

    // ========================================================================
    // Items
    // ========================================================================

    /// Item whose `nameKey` (or `name`) matches case-insensitively.
    pub fn find_existing_item(&self, name: &str) -> Option<Entity> {
        let key = name_key(name);
        if key.is_empty() {
            return None;
        }
        self.executor.store().find_by(&self.items(), |item| {
            item.text(NAME_KEY)
                .filter(|k| !k.is_empty())
                .or_else(|| item.text(NAME))
                .is_some_and(|k| name_key(k) == key)
        })
    }

    /// Add an item, or merge the quantity into an item with the same name.
    ///
    /// New items get a remote-allocated id up front, so follow-up writes can
    /// target the item before its creation is acknowledged.
    pub fn add_item(&self, name: &str, qty: &str) -> Result<MutationHandle, MutationError> {
        self.require_household(MutationKind::Create)?;
        let items = self.items();
        let name = name.trim();
        if name.is_empty() {
            return Err(self.invalid(MutationKind::Create, &items, None, "Enter a name"));
        }
        let qty = qty.trim();
        match self.find_existing_item(name) {
            Some(existing) => {
                let current = existing.text(QTY).unwrap_or("");
                let merged = merge_quantities(current, qty, self.decimal_style);
                let patch = relist(Patch::new().set(QTY, merged));
                self.executor
                    .apply(Mutation::update(&items, &existing.id, patch))
            }
            None => {
                let id = self.executor.new_document_id(&items);
                self.executor
                    .apply(Mutation::create_with_id(&items, &id, new_item_patch(name, qty)))
            }
        }
    }

    /// Checking parks the quantity in `qtyBeforeCheck` and zeroes it;
    /// unchecking restores it.
    pub fn set_checked(&self, id: &EntityId, checked: bool) -> Result<MutationHandle, MutationError> {
        self.require_household(MutationKind::Update)?;
        let item = self.item(id)?;
        let patch = if checked {
            let mut patch = Patch::new()
                .set(CHECKED, true)
                .set(QTY, "0")
                .server_timestamp(CHECKED_AT)
                .touched();
            // Re-checking must not overwrite the parked quantity with "0".
            if !item.flag(CHECKED) {
                patch = patch.set(QTY_BEFORE_CHECK, item.text(QTY).unwrap_or(""));
            }
            patch
        } else {
            uncheck_patch(&item)
        };
        self.executor.apply(Mutation::update(&self.items(), id, patch))
    }

    /// Add `amount` to an item's quantity.
    ///
    /// A bare number is summed; a quantity with a unit is merged unit-aware.
    /// If the item had no positive quantity it goes back on the list.
    pub fn add_quantity(&self, id: &EntityId, amount: f64) -> Result<MutationHandle, MutationError> {
        self.require_household(MutationKind::Update)?;
        let items = self.items();
        if !amount.is_finite() || amount <= 0.0 {
            return Err(self.invalid(MutationKind::Update, &items, Some(id), "Enter a quantity"));
        }
        let item = self.item(id)?;
        let current = item.text(QTY).unwrap_or("").trim();
        let parsed = parse_quantity(current);
        let positive = parsed.as_ref().is_some_and(|q| q.amount > 0.0);
        let addend = format_amount(amount, self.decimal_style);

        let next = match &parsed {
            Some(q) if positive && q.tail.is_empty() => {
                format_amount(q.amount + amount, self.decimal_style)
            }
            _ if !positive && parsed.as_ref().is_none_or(|q| q.tail.is_empty()) => addend,
            _ => merge_quantities(current, &addend, self.decimal_style),
        };

        let patch = Patch::new().set(QTY, next);
        let patch = if positive { patch.touched() } else { relist(patch) };
        self.executor.apply(Mutation::update(&items, id, patch))
    }

    /// Uncheck every checked list item in one batch, restoring parked quantities.
    pub fn clear_checked(&self) -> Result<MutationHandle, MutationError> {
        self.require_household(MutationKind::Batch)?;
        let collection = &self.items();
        let ops: Vec<BatchOp> = self
            .executor
            .store()
            .filter_by(collection, |e| e.flag(CHECKED))
            .iter()
            .map(|e| BatchOp::set(collection, &e.id, uncheck_patch(e)))
            .collect();
        if ops.is_empty() {
            return Err(self.invalid(MutationKind::Batch, collection, None, "Nothing to clear"));
        }
        self.executor.apply(Mutation::batch(ops))
    }

    // ========================================================================
    // Weekly staples
    // ========================================================================

    /// Put every checked weekly staple on the list in one batch.
    ///
    /// A checked list item is unchecked and takes the staple's quantity; an
    /// unchecked one has the quantity added; anything else becomes a new item.
    pub fn add_weekly_to_list(&self) -> Result<MutationHandle, MutationError> {
        self.require_household(MutationKind::Batch)?;
        let items = self.items();
        let picked = self
            .executor
            .store()
            .filter_by(&self.weekly(), |e| e.flag(CHECKED));

        let mut plan: Vec<PlannedItem> = Vec::new();
        for staple in &picked {
            let name = staple.text(NAME).unwrap_or("").trim();
            let key = name_key(name);
            if key.is_empty() {
                continue;
            }
            let qty = format_amount(weekly_qty(staple), self.decimal_style);
            if let Some(entry) = plan.iter_mut().find(|p| p.key == key) {
                entry.qty = merge_quantities(&entry.qty, &qty, self.decimal_style);
                continue;
            }
            let planned = match self.find_existing_item(name) {
                Some(existing) => PlannedItem {
                    qty: if existing.flag(CHECKED) {
                        qty
                    } else {
                        merge_quantities(existing.text(QTY).unwrap_or(""), &qty, self.decimal_style)
                    },
                    id: existing.id,
                    key,
                    name: name.to_string(),
                    is_new: false,
                },
                None => PlannedItem {
                    id: self.executor.new_document_id(&items),
                    key,
                    name: name.to_string(),
                    qty,
                    is_new: true,
                },
            };
            plan.push(planned);
        }
        if plan.is_empty() {
            return Err(self.invalid(MutationKind::Batch, &items, None, "Nothing selected"));
        }
        self.executor.apply(Mutation::batch(plan_ops(&items, plan)))
    }

    /// Uncheck every weekly staple. Quantities stay as they are.
    pub fn reset_weekly(&self) -> Result<MutationHandle, MutationError> {
        self.require_household(MutationKind::Batch)?;
        let weekly = self.weekly();
        let ops: Vec<BatchOp> = self
            .executor
            .store()
            .filter_by(&weekly, |e| e.flag(CHECKED))
            .iter()
            .map(|e| BatchOp::set(&weekly, &e.id, Patch::new().set(CHECKED, false).touched()))
            .collect();
        if ops.is_empty() {
            return Err(self.invalid(MutationKind::Batch, &weekly, None, "Nothing to clear"));
        }
        self.executor.apply(Mutation::batch(ops))
    }

    // ========================================================================
    // Recipes
    // ========================================================================

    /// Scale a recipe to `servings` and merge its ingredients into the list.
    ///
    /// All writes go out as one batch. New items get remote-allocated ids up
    /// front, so repeated ingredient names collapse into one item.
    pub fn add_recipe_to_list(
        &self,
        recipe_id: &EntityId,
        servings: u32,
    ) -> Result<MutationHandle, MutationError> {
        self.require_household(MutationKind::Batch)?;
        let items = self.items();
        if servings == 0 {
            return Err(self.invalid(MutationKind::Batch, &items, None, "Enter servings"));
        }
        let recipe = self.recipe(recipe_id)?;
        let factor = f64::from(servings) / base_portions(&recipe);

        let mut plan: Vec<PlannedItem> = Vec::new();
        for ingredient in recipe_ingredients(&recipe) {
            let key = name_key(&ingredient.name);
            let scaled = scale_quantity(&ingredient.qty, factor, self.decimal_style);
            if let Some(entry) = plan.iter_mut().find(|p| p.key == key) {
                entry.qty = merge_quantities(&entry.qty, &scaled, self.decimal_style);
                continue;
            }
            let planned = match self.find_existing_item(&ingredient.name) {
                Some(existing) => PlannedItem {
                    qty: merge_quantities(existing.text(QTY).unwrap_or(""), &scaled, self.decimal_style),
                    id: existing.id,
                    key,
                    name: ingredient.name,
                    is_new: false,
                },
                None => PlannedItem {
                    id: self.executor.new_document_id(&items),
                    key,
                    name: ingredient.name,
                    qty: scaled,
                    is_new: true,
                },
            };
            plan.push(planned);
        }
        if plan.is_empty() {
            return Err(self.invalid(MutationKind::Batch, &items, None, "Nothing to add"));
        }

        self.executor.apply(Mutation::batch(plan_ops(&items, plan)))
    }

    pub fn save_recipe(&self, draft: RecipeDraft) -> Result<MutationHandle, MutationError> {
        let kind = if draft.id.is_some() {
            MutationKind::Update
        } else {
            MutationKind::Create
        };
        self.require_household(kind)?;
        let recipes = self.recipes();
        let reject = |reason: &str| self.invalid(kind, &recipes, draft.id.as_ref(), reason);

        let name = draft.name.trim();
        if name.is_empty() {
            return Err(reject("Name is required"));
        }
        let mut tags: Vec<String> = Vec::new();
        for tag in &draft.tags {
            let tag = tag.trim().to_lowercase();
            if !is_valid_tag(&tag) {
                return Err(reject(&format!("Invalid tag: {tag}")));
            }
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        if tags.len() > self.max_tags {
            return Err(reject(&format!("Max {} tags", self.max_tags)));
        }

        let ingredients = draft
            .ingredients
            .iter()
            .filter(|i| !i.name.trim().is_empty() || !i.qty.trim().is_empty())
            .map(Ingredient::to_value)
            .collect::<Vec<_>>();
        let steps = draft
            .steps
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(FieldValue::from)
            .collect::<Vec<_>>();

        let mut patch = Patch::new()
            .set(NAME, name)
            .set(NAME_LOWER, name.to_lowercase())
            .set(BASE_PORTIONS, i64::from(draft.base_portions))
            .set(TAGS, tags.into_iter().map(FieldValue::from).collect::<Vec<_>>())
            .set(INGREDIENTS, ingredients)
            .set(STEPS, steps)
            .touched();
        patch = match draft.desc.as_deref().map(str::trim) {
            Some(desc) if !desc.is_empty() => patch.set(DESC, desc),
            _ => patch.delete(DESC),
        };

        match &draft.id {
            Some(id) => self.executor.apply(Mutation::upsert(&recipes, id, patch)),
            None => self
                .executor
                .apply(Mutation::create(&recipes, patch.server_timestamp(CREATED_AT))),
        }
    }

    pub fn delete_recipe(&self, id: &EntityId) -> Result<MutationHandle, MutationError> {
        self.require_household(MutationKind::Delete)?;
        self.executor.apply(Mutation::delete(&self.recipes(), id))
    }

    /// Add one tag to a recipe. `Ok(None)` when the recipe already has it.
    pub fn add_recipe_tag(
        &self,
        id: &EntityId,
        tag: &str,
    ) -> Result<Option<MutationHandle>, MutationError> {
        self.require_household(MutationKind::Update)?;
        let recipes = self.recipes();
        let tag = tag.trim().to_lowercase();
        if !is_valid_tag(&tag) {
            return Err(self.invalid(MutationKind::Update, &recipes, Some(id), "Invalid tag"));
        }
        let recipe = self.recipe(id)?;
        let merged = merge_tag_sets(&recipe_tags(&recipe), &tag, self.max_tags);
        match merged.outcome {
            TagOutcome::Added => {
                let tags: Vec<FieldValue> = merged.tags.into_iter().map(FieldValue::from).collect();
                let patch = Patch::new().set(TAGS, tags).touched();
                self.executor
                    .apply(Mutation::update(&recipes, id, patch))
                    .map(Some)
            }
            TagOutcome::Duplicate => Ok(None),
            TagOutcome::AtCapacity => Err(self.invalid(
                MutationKind::Update,
                &recipes,
                Some(id),
                &format!("Max {} tags", self.max_tags),
            )),
            TagOutcome::Invalid => {
                Err(self.invalid(MutationKind::Update, &recipes, Some(id), "Invalid tag"))
            }
        }
    }
}
