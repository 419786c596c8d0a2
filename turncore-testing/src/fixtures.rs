//! Small game commands and entity builders for tests.

use serde_json::json;
use turncore::bus::Event;
use turncore::command::Command;
use turncore::entity::{Entity, Payload};
use turncore::errors::{CommandError, CommandResult};
use turncore::transaction::Transaction;
use turncore::types::{EntityId, EntityKind};

fn kind(name: &'static str) -> EntityKind {
    EntityKind::try_new(name).expect("fixture kinds are valid")
}

/// A level 1 player holding `gold`.
pub fn player(gold: i64) -> Entity {
    Entity::new(kind("player"))
        .with("gold", gold)
        .with("level", 1)
        .with("xp", 0)
}

/// A raid boss with `hp` hit points.
pub fn boss(hp: i64) -> Entity {
    Entity::new(kind("boss"))
        .with("hp", hp)
        .with("max_hp", hp)
        .with("template", "ancient_dragon")
        .with("defeated", false)
}

/// An item of `template`, optionally owned.
pub fn item(template: &str, owner: Option<&EntityId>) -> Entity {
    let entity = Entity::new(kind("item")).with("template", template);
    match owner {
        Some(owner) => entity.with("owner", owner.to_string()),
        None => entity,
    }
}

fn gold_of(txn: &mut Transaction<'_>, id: &EntityId) -> CommandResult<i64> {
    Ok(txn.require(id)?.get_i64("gold").unwrap_or(0))
}

fn set_gold(txn: &mut Transaction<'_>, id: &EntityId, old: i64, new: i64, reason: &str) -> CommandResult<()> {
    txn.require_mut(id)?.set("gold", new);
    txn.emit(Event::CounterChanged {
        actor: id.clone(),
        counter: "gold".to_string(),
        old,
        new,
        reason: reason.to_string(),
    })?;
    Ok(())
}

fn payload(pairs: &[(&str, serde_json::Value)]) -> Payload {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_string(), value.clone()))
        .collect()
}

/// Adds gold to a player.
#[derive(Debug, Clone)]
pub struct GainGold {
    player: EntityId,
    amount: i64,
}

impl GainGold {
    /// `amount` gold for `player`.
    pub const fn new(player: EntityId, amount: i64) -> Self {
        Self { player, amount }
    }
}

impl Command for GainGold {
    fn name(&self) -> &str {
        "gain_gold"
    }

    fn dependencies(&self) -> Vec<EntityId> {
        vec![self.player.clone()]
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        let old = gold_of(txn, &self.player)?;
        let new = old + self.amount;
        set_gold(txn, &self.player, old, new, "gain")?;
        Ok(payload(&[("gold", json!(new))]))
    }
}

/// Removes gold from a player, refusing to go below zero.
#[derive(Debug, Clone)]
pub struct SpendGold {
    player: EntityId,
    amount: i64,
}

impl SpendGold {
    /// `amount` gold from `player`.
    pub const fn new(player: EntityId, amount: i64) -> Self {
        Self { player, amount }
    }
}

impl Command for SpendGold {
    fn name(&self) -> &str {
        "spend_gold"
    }

    fn dependencies(&self) -> Vec<EntityId> {
        vec![self.player.clone()]
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        let old = gold_of(txn, &self.player)?;
        if old < self.amount {
            return Err(CommandError::validation("Insufficient gold"));
        }
        let new = old - self.amount;
        set_gold(txn, &self.player, old, new, "spend")?;
        Ok(payload(&[("gold", json!(new))]))
    }
}

/// Moves gold between two players.
#[derive(Debug, Clone)]
pub struct TransferGold {
    from: EntityId,
    to: EntityId,
    amount: i64,
}

impl TransferGold {
    /// `amount` gold from `from` to `to`.
    pub const fn new(from: EntityId, to: EntityId, amount: i64) -> Self {
        Self { from, to, amount }
    }
}

impl Command for TransferGold {
    fn name(&self) -> &str {
        "transfer_gold"
    }

    fn dependencies(&self) -> Vec<EntityId> {
        vec![self.from.clone(), self.to.clone()]
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        let from_old = gold_of(txn, &self.from)?;
        let to_old = gold_of(txn, &self.to)?;
        if from_old < self.amount {
            return Err(CommandError::validation("Insufficient gold"));
        }
        set_gold(txn, &self.from, from_old, from_old - self.amount, "transfer")?;
        set_gold(txn, &self.to, to_old, to_old + self.amount, "transfer")?;
        Ok(payload(&[
            ("from_gold", json!(from_old - self.amount)),
            ("to_gold", json!(to_old + self.amount)),
        ]))
    }
}

/// A player hits a boss; the killing blow marks it defeated.
#[derive(Debug, Clone)]
pub struct DamageBoss {
    player: EntityId,
    boss: EntityId,
    damage: i64,
}

impl DamageBoss {
    /// `player` deals `damage` to `boss`.
    pub const fn new(player: EntityId, boss: EntityId, damage: i64) -> Self {
        Self { player, boss, damage }
    }
}

impl Command for DamageBoss {
    fn name(&self) -> &str {
        "damage_boss"
    }

    fn dependencies(&self) -> Vec<EntityId> {
        vec![self.player.clone(), self.boss.clone()]
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        txn.require(&self.player)?;
        let boss = txn.require_mut(&self.boss)?;
        if boss.get_bool("defeated").unwrap_or(false) {
            return Err(CommandError::validation("Boss already defeated"));
        }

        let hp = boss.get_i64("hp").unwrap_or(0);
        let remaining = (hp - self.damage).max(0);
        boss.set("hp", remaining);
        let killed = remaining == 0;
        let template = boss.get_str("template").unwrap_or("unknown").to_string();
        if killed {
            boss.set("defeated", true);
            boss.set("killed_by", self.player.to_string());
            txn.emit(Event::MobKilled {
                player: self.player.clone(),
                mob: self.boss.clone(),
                template,
                damage_dealt: self.damage,
            })?;
        }
        Ok(payload(&[("hp", json!(remaining)), ("killed", json!(killed))]))
    }
}

/// Creates an entity that must not exist yet.
#[derive(Debug, Clone)]
pub struct SpawnEntity {
    id: EntityId,
    entity: Entity,
}

impl SpawnEntity {
    /// Creates `entity` under `id`.
    pub const fn new(id: EntityId, entity: Entity) -> Self {
        Self { id, entity }
    }
}

impl Command for SpawnEntity {
    fn name(&self) -> &str {
        "spawn_entity"
    }

    fn dependencies(&self) -> Vec<EntityId> {
        vec![self.id.clone()]
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        if txn.exists(&self.id)? {
            return Err(CommandError::validation(format!("Entity {} already exists", self.id)));
        }
        txn.set(self.id.clone(), self.entity.clone())?;
        txn.emit(Event::EntityCreated {
            id: self.id.clone(),
            kind: self.entity.kind().clone(),
        })?;
        Ok(payload(&[("id", json!(self.id.to_string()))]))
    }
}

/// Removes an entity that must exist.
#[derive(Debug, Clone)]
pub struct RemoveEntity {
    id: EntityId,
}

impl RemoveEntity {
    /// Removes `id`.
    pub const fn new(id: EntityId) -> Self {
        Self { id }
    }
}

impl Command for RemoveEntity {
    fn name(&self) -> &str {
        "remove_entity"
    }

    fn dependencies(&self) -> Vec<EntityId> {
        vec![self.id.clone()]
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        let kind = txn.require(&self.id)?.kind().clone();
        txn.delete(&self.id)?;
        txn.emit(Event::EntityRemoved {
            id: self.id.clone(),
            kind,
        })?;
        Ok(Payload::new())
    }
}

/// Writes to its target, then fails.
#[derive(Debug, Clone)]
pub struct FailingCommand {
    target: EntityId,
    message: String,
}

impl FailingCommand {
    /// Fails with `message` after zeroing `target`'s gold.
    pub fn new(target: EntityId, message: impl Into<String>) -> Self {
        Self {
            target,
            message: message.into(),
        }
    }
}

impl Command for FailingCommand {
    fn name(&self) -> &str {
        "failing_command"
    }

    fn dependencies(&self) -> Vec<EntityId> {
        vec![self.target.clone()]
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        txn.require_mut(&self.target)?.set("gold", 0);
        txn.emit(Event::AchievementUnlocked {
            player: self.target.clone(),
            achievement: "never_published".to_string(),
        })?;
        Err(CommandError::validation(self.message.clone()))
    }
}

/// Declares one id but also writes another.
#[derive(Debug, Clone)]
pub struct UndeclaredWrite {
    declared: EntityId,
    undeclared: EntityId,
}

impl UndeclaredWrite {
    /// Declares `declared`, also writes `undeclared`.
    pub const fn new(declared: EntityId, undeclared: EntityId) -> Self {
        Self { declared, undeclared }
    }
}

impl Command for UndeclaredWrite {
    fn name(&self) -> &str {
        "undeclared_write"
    }

    fn dependencies(&self) -> Vec<EntityId> {
        vec![self.declared.clone()]
    }

    fn execute(&self, txn: &mut Transaction<'_>) -> CommandResult<Payload> {
        txn.require(&self.declared)?;
        txn.set(self.undeclared.clone(), player(999))?;
        Ok(Payload::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turncore::errors::ExecutionError;
    use turncore::store::{EntityStore, MemoryEntityStore};
    use turncore::CommandExecutor;

    fn id(s: &str) -> EntityId {
        EntityId::try_new(s).unwrap()
    }

    fn executor(entities: Vec<(&str, Entity)>) -> CommandExecutor<MemoryEntityStore> {
        CommandExecutor::new(entities.into_iter().map(|(name, entity)| (id(name), entity)).collect())
    }

    #[tokio::test]
    async fn spend_rejects_overdraft() {
        let mut executor = executor(vec![("p1", player(30))]);
        let result = executor.execute(&SpendGold::new(id("p1"), 50)).await;
        assert_eq!(
            result.error,
            Some(ExecutionError::ValidationFailure("Insufficient gold".to_string()))
        );
    }

    #[tokio::test]
    async fn killing_blow_marks_the_boss_defeated() {
        let mut executor = executor(vec![("p1", player(0)), ("boss", boss(20))]);

        let first = executor.execute(&DamageBoss::new(id("p1"), id("boss"), 15)).await;
        assert_eq!(first.data["killed"], json!(false));
        let second = executor.execute(&DamageBoss::new(id("p1"), id("boss"), 15)).await;
        assert_eq!(second.data["hp"], json!(0));

        let stored = executor.store().get(&id("boss")).unwrap();
        assert_eq!(stored.get_bool("defeated"), Some(true));
        assert_eq!(stored.get_str("killed_by"), Some("p1"));
        let third = executor.execute(&DamageBoss::new(id("p1"), id("boss"), 1)).await;
        assert!(!third.success);
    }

    #[tokio::test]
    async fn spawn_refuses_existing_ids() {
        let mut executor = executor(vec![("p1", player(0))]);
        let clash = executor.execute(&SpawnEntity::new(id("p1"), player(5))).await;
        assert!(!clash.success);

        let spawned = executor
            .execute(&SpawnEntity::new(id("sword"), item("sword", Some(&id("p1")))))
            .await;
        assert!(spawned.success, "{:?}", spawned.error);
        assert_eq!(
            executor.store().get(&id("sword")).unwrap().references("owner"),
            vec![id("p1")]
        );
    }
}
