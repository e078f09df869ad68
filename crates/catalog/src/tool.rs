use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use toolhub_core::{Aggregate, AggregateId, AggregateRoot, CategoryId, DomainError, ManufacturerId};
use toolhub_events::Event;

use crate::source::ToolState;

/// Tool identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolId(pub AggregateId);

impl ToolId {
    pub const fn new(raw: i64) -> Self {
        Self(AggregateId::new(raw))
    }

    pub const fn get(self) -> i64 {
        self.0.get()
    }
}

impl core::fmt::Display for ToolId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<AggregateId> for ToolId {
    fn from(value: AggregateId) -> Self {
        Self(value)
    }
}

/// Kind of tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolType {
    Hand,
    Power,
    Pneumatic,
    Garden,
    Measuring,
}

impl ToolType {
    pub const fn as_str(self) -> &'static str {
        match self {
            ToolType::Hand => "HAND",
            ToolType::Power => "POWER",
            ToolType::Pneumatic => "PNEUMATIC",
            ToolType::Garden => "GARDEN",
            ToolType::Measuring => "MEASURING",
        }
    }
}

/// Physical condition of a listed tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCondition {
    New,
    LikeNew,
    Good,
    Fair,
    Worn,
}

impl ToolCondition {
    pub const fn as_str(self) -> &'static str {
        match self {
            ToolCondition::New => "NEW",
            ToolCondition::LikeNew => "LIKE_NEW",
            ToolCondition::Good => "GOOD",
            ToolCondition::Fair => "FAIR",
            ToolCondition::Worn => "WORN",
        }
    }
}

/// Mutable attributes of a tool, as supplied by create/update commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolDetails {
    pub manufacturer_id: ManufacturerId,
    pub category_id: CategoryId,
    pub tool_type: ToolType,
    pub condition: ToolCondition,
    pub price: Decimal,
    pub description: String,
}

/// Complete, committed state of one tool at `version`.
///
/// This is what events carry and what the projector consumes. It is never
/// partial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSnapshot {
    pub tool_id: ToolId,
    pub manufacturer_id: ManufacturerId,
    pub category_id: CategoryId,
    pub tool_type: ToolType,
    pub condition: ToolCondition,
    pub price: Decimal,
    pub description: String,
    pub version: u64,
}

impl ToolSnapshot {
    fn from_details(tool_id: ToolId, details: &ToolDetails, version: u64) -> Self {
        Self {
            tool_id,
            manufacturer_id: details.manufacturer_id,
            category_id: details.category_id,
            tool_type: details.tool_type,
            condition: details.condition,
            price: details.price,
            description: details.description.clone(),
            version,
        }
    }

    fn details(&self) -> ToolDetails {
        ToolDetails {
            manufacturer_id: self.manufacturer_id,
            category_id: self.category_id,
            tool_type: self.tool_type,
            condition: self.condition,
            price: self.price,
            description: self.description.clone(),
        }
    }
}

/// Aggregate root: Tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    id: ToolId,
    details: Option<ToolDetails>,
    version: u64,
    deleted: bool,
}

impl Tool {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: ToolId) -> Self {
        Self {
            id,
            details: None,
            version: 0,
            deleted: false,
        }
    }

    /// Created and not deleted.
    pub fn is_live(&self) -> bool {
        self.details.is_some() && !self.deleted
    }

    pub fn details(&self) -> Option<&ToolDetails> {
        self.details.as_ref().filter(|_| !self.deleted)
    }

    /// What readers of the committed state see. A deleted tool keeps the
    /// version of its deletion.
    pub fn state(&self) -> ToolState {
        if self.deleted {
            return ToolState::Deleted {
                version: self.version,
            };
        }
        self.snapshot().map_or(ToolState::Absent, ToolState::Live)
    }

    /// Snapshot of the committed state, or `None` if the tool is not live.
    pub fn snapshot(&self) -> Option<ToolSnapshot> {
        self.details()
            .map(|d| ToolSnapshot::from_details(self.id, d, self.version))
    }
}

impl AggregateRoot for Tool {
    type Id = ToolId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateTool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTool {
    pub tool_id: ToolId,
    pub details: ToolDetails,
}

/// Command: UpdateTool (full replacement of the mutable attributes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateTool {
    pub tool_id: ToolId,
    pub details: ToolDetails,
}

/// Command: DeleteTool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTool {
    pub tool_id: ToolId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolCommand {
    Create(CreateTool),
    Update(UpdateTool),
    Delete(DeleteTool),
}

impl ToolCommand {
    pub fn tool_id(&self) -> ToolId {
        match self {
            ToolCommand::Create(c) => c.tool_id,
            ToolCommand::Update(c) => c.tool_id,
            ToolCommand::Delete(c) => c.tool_id,
        }
    }
}

/// Committed mutation of a tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolEvent {
    Created(ToolSnapshot),
    Updated(ToolSnapshot),
    Deleted { tool_id: ToolId, version: u64 },
}

impl ToolEvent {
    pub fn tool_id(&self) -> ToolId {
        match self {
            ToolEvent::Created(s) | ToolEvent::Updated(s) => s.tool_id,
            ToolEvent::Deleted { tool_id, .. } => *tool_id,
        }
    }

    /// Aggregate version after this mutation.
    pub fn version_after(&self) -> u64 {
        match self {
            ToolEvent::Created(s) | ToolEvent::Updated(s) => s.version,
            ToolEvent::Deleted { version, .. } => *version,
        }
    }

    /// Short variant name used in logs and dead-letter records.
    pub fn kind(&self) -> &'static str {
        match self {
            ToolEvent::Created(_) => "created",
            ToolEvent::Updated(_) => "updated",
            ToolEvent::Deleted { .. } => "deleted",
        }
    }
}

impl Event for ToolEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ToolEvent::Created(_) => "catalog.tool.created",
            ToolEvent::Updated(_) => "catalog.tool.updated",
            ToolEvent::Deleted { .. } => "catalog.tool.deleted",
        }
    }

    fn schema_version(&self) -> u32 {
        1
    }

    fn aggregate_id(&self) -> AggregateId {
        self.tool_id().0
    }

    fn version_after(&self) -> u64 {
        ToolEvent::version_after(self)
    }
}

impl Aggregate for Tool {
    type Command = ToolCommand;
    type Event = ToolEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            ToolEvent::Created(s) | ToolEvent::Updated(s) => {
                self.id = s.tool_id;
                self.details = Some(s.details());
            }
            ToolEvent::Deleted { .. } => {
                self.deleted = true;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        if command.tool_id() != self.id {
            return Err(DomainError::invariant("tool_id mismatch"));
        }

        match command {
            ToolCommand::Create(cmd) => self.handle_create(cmd),
            ToolCommand::Update(cmd) => self.handle_update(cmd),
            ToolCommand::Delete(cmd) => self.handle_delete(cmd),
        }
    }
}

impl Tool {
    fn validate(details: &ToolDetails) -> Result<(), DomainError> {
        if details.price < Decimal::ZERO {
            return Err(DomainError::validation("price cannot be negative"));
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateTool) -> Result<Vec<ToolEvent>, DomainError> {
        if self.deleted {
            return Err(DomainError::conflict("tool id belongs to a deleted tool"));
        }
        if self.details.is_some() {
            return Err(DomainError::conflict("tool already exists"));
        }
        Self::validate(&cmd.details)?;

        Ok(vec![ToolEvent::Created(ToolSnapshot::from_details(
            cmd.tool_id,
            &cmd.details,
            self.version + 1,
        ))])
    }

    fn handle_update(&self, cmd: &UpdateTool) -> Result<Vec<ToolEvent>, DomainError> {
        if !self.is_live() {
            return Err(DomainError::not_found(cmd.tool_id.get()));
        }
        Self::validate(&cmd.details)?;

        Ok(vec![ToolEvent::Updated(ToolSnapshot::from_details(
            cmd.tool_id,
            &cmd.details,
            self.version + 1,
        ))])
    }

    fn handle_delete(&self, cmd: &DeleteTool) -> Result<Vec<ToolEvent>, DomainError> {
        if !self.is_live() {
            return Err(DomainError::not_found(cmd.tool_id.get()));
        }

        Ok(vec![ToolEvent::Deleted {
            tool_id: cmd.tool_id,
            version: self.version + 1,
        }])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details(price: i64, description: &str) -> ToolDetails {
        ToolDetails {
            manufacturer_id: ManufacturerId::new(10),
            category_id: CategoryId::new(20),
            tool_type: ToolType::Power,
            condition: ToolCondition::Good,
            price: Decimal::from(price),
            description: description.to_string(),
        }
    }

    fn create(id: i64, price: i64) -> ToolCommand {
        ToolCommand::Create(CreateTool {
            tool_id: ToolId::new(id),
            details: details(price, "desc"),
        })
    }

    #[test]
    fn create_emits_created_snapshot_at_version_one() {
        let tool = Tool::empty(ToolId::new(1));
        let events = tool.handle(&create(1, 3000)).unwrap();

        assert_eq!(events.len(), 1);
        match &events[0] {
            ToolEvent::Created(s) => {
                assert_eq!(s.tool_id, ToolId::new(1));
                assert_eq!(s.price, Decimal::from(3000));
                assert_eq!(s.description, "desc");
                assert_eq!(s.version, 1);
            }
            other => panic!("expected Created, got {other:?}"),
        }
    }

    #[test]
    fn create_rejects_negative_price() {
        let tool = Tool::empty(ToolId::new(1));
        let err = tool.handle(&create(1, -5)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn create_rejects_duplicate() {
        let mut tool = Tool::empty(ToolId::new(1));
        tool.execute(&create(1, 100)).unwrap();

        let err = tool.handle(&create(1, 100)).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn update_requires_existing_tool() {
        let tool = Tool::empty(ToolId::new(2));
        let cmd = ToolCommand::Update(UpdateTool {
            tool_id: ToolId::new(2),
            details: details(200, "x"),
        });
        assert_eq!(tool.handle(&cmd).unwrap_err(), DomainError::NotFound { id: 2 });
    }

    #[test]
    fn deleted_tool_is_not_live_and_cannot_be_recreated() {
        let mut tool = Tool::empty(ToolId::new(3));
        tool.execute(&create(3, 100)).unwrap();
        let events = tool
            .execute(&ToolCommand::Delete(DeleteTool {
                tool_id: ToolId::new(3),
            }))
            .unwrap();

        assert_eq!(
            events,
            vec![ToolEvent::Deleted {
                tool_id: ToolId::new(3),
                version: 2
            }]
        );
        assert!(!tool.is_live());
        assert!(tool.snapshot().is_none());
        assert!(matches!(
            tool.handle(&create(3, 100)).unwrap_err(),
            DomainError::Conflict(_)
        ));
    }

    #[test]
    fn command_for_other_id_is_rejected() {
        let tool = Tool::empty(ToolId::new(4));
        assert!(matches!(
            tool.handle(&create(5, 1)).unwrap_err(),
            DomainError::InvariantViolation(_)
        ));
    }

    #[test]
    fn event_serializes_with_kind_tag() {
        let ev = ToolEvent::Deleted {
            tool_id: ToolId::new(9),
            version: 4,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "deleted", "tool_id": 9, "version": 4}));
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Every accepted command bumps the version by exactly one and the
            /// emitted event carries the post-mutation version.
            #[test]
            fn version_tracks_committed_mutations(prices in proptest::collection::vec(0i64..1_000_000, 1..20)) {
                let id = ToolId::new(77);
                let mut tool = Tool::empty(id);

                for (idx, price) in prices.iter().enumerate() {
                    let cmd = if idx == 0 {
                        create(77, *price)
                    } else {
                        ToolCommand::Update(UpdateTool { tool_id: id, details: details(*price, "p") })
                    };
                    let before = tool.version();
                    let events = tool.execute(&cmd).unwrap();
                    prop_assert_eq!(events.len(), 1);
                    prop_assert_eq!(events[0].version_after(), before + 1);
                    prop_assert_eq!(tool.version(), before + 1);
                }

                let snap = tool.snapshot().unwrap();
                prop_assert_eq!(snap.price, Decimal::from(*prices.last().unwrap()));
                prop_assert_eq!(snap.version, prices.len() as u64);
            }
        }
    }
}
