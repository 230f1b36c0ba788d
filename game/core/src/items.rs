//! Raw item records and the inventory/bank containers. The 20-byte item
//! record format is shared by every client version.

use crate::wire::{Reader, WireError, Writer};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::fmt;

/// Meseta is moved around as a pseudo-item whose first identifier byte is
/// 0x04; it never occupies an inventory slot.
pub const MESETA_IDENTIFIER: u32 = 0x0004_0000;
pub const MESETA_LIMIT: u32 = 999_999;

/// Removing with this id means "remove meseta, not an item".
pub const MESETA_ITEM_ID: u32 = 0xFFFF_FFFF;

pub const INVENTORY_SLOTS: usize = 30;
pub const BANK_SLOTS: usize = 200;

lazy_static! {
    /// Tools that stack, and how high each stack goes. data1[5] carries the
    /// stack count for these.
    static ref STACK_LIMITS: HashMap<u32, u8> = {
        let mut limits = HashMap::new();
        for &identifier in &[
            0x030000, 0x030001, 0x030002, 0x030100, 0x030101, 0x030102, 0x030300,
            0x030400, 0x030500, 0x030600, 0x030601, 0x030700, 0x030800,
        ] {
            limits.insert(identifier, 10);
        }
        for &identifier in &[0x031000, 0x031001, 0x031002] {
            limits.insert(identifier, 99);
        }
        limits
    };
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ItemError {
    InventoryFull,
    BankFull,
    NotPresent { item_id: u32 },
    NotEnoughMeseta,
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ItemError::InventoryFull => write!(f, "inventory is full"),
            ItemError::BankFull => write!(f, "bank is full"),
            ItemError::NotPresent { item_id } => write!(f, "item {:08X} not present", item_id),
            ItemError::NotEnoughMeseta => write!(f, "not enough meseta"),
        }
    }
}

impl std::error::Error for ItemError {}

/// The raw 20-byte item record.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ItemData {
    pub data1: [u8; 12],
    pub item_id: u32,
    pub data2: [u8; 4],
}

impl ItemData {
    /// The item's type identity: the first three bytes of `data1` read as a
    /// big-endian number. Two stacks combine exactly when this matches.
    #[inline]
    pub fn primary_identifier(&self) -> u32 {
        (u32::from(self.data1[0]) << 16) | (u32::from(self.data1[1]) << 8) | u32::from(self.data1[2])
    }

    /// Stack limit, for items that stack at all.
    pub fn stack_limit(&self) -> Option<u8> {
        STACK_LIMITS.get(&self.primary_identifier()).copied()
    }

    #[inline]
    pub fn stack_size(&self) -> u8 {
        self.data1[5]
    }

    /// A meseta pseudo-item worth `amount`.
    pub fn meseta(amount: u32) -> ItemData {
        let mut item = ItemData::default();
        item.data1[0] = 0x04;
        item.data2 = amount.to_le_bytes();
        item
    }

    /// The meseta amount carried in `data2`.
    #[inline]
    pub fn data2_amount(&self) -> u32 {
        u32::from_le_bytes(self.data2)
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_bytes(&self.data1);
        writer.put_u32(self.item_id);
        writer.put_bytes(&self.data2);
    }

    pub fn read(reader: &mut Reader) -> Result<ItemData, WireError> {
        let mut item = ItemData::default();
        item.data1.copy_from_slice(reader.get_bytes(12)?);
        item.item_id = reader.get_u32()?;
        item.data2.copy_from_slice(reader.get_bytes(4)?);
        Ok(item)
    }
}

/// One occupied inventory slot.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct InventoryItem {
    pub equip_flags: u16,
    pub tech_flag: u16,
    pub game_flags: u32,
    pub data: ItemData,
}

impl InventoryItem {
    pub fn to_bank_item(&self) -> BankItem {
        let amount = match self.data.stack_limit() {
            Some(_) => u16::from(self.data.stack_size()),
            None => 1,
        };
        BankItem { data: self.data, amount, show_flags: 1 }
    }

    pub fn write(&self, writer: &mut Writer) {
        writer.put_u16(self.equip_flags);
        writer.put_u16(self.tech_flag);
        writer.put_u32(self.game_flags);
        self.data.write(writer);
    }

    pub fn read(reader: &mut Reader) -> Result<InventoryItem, WireError> {
        Ok(InventoryItem {
            equip_flags: reader.get_u16()?,
            tech_flag: reader.get_u16()?,
            game_flags: reader.get_u32()?,
            data: ItemData::read(reader)?,
        })
    }
}

/// One occupied bank slot.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BankItem {
    pub data: ItemData,
    pub amount: u16,
    pub show_flags: u16,
}

impl BankItem {
    pub fn to_inventory_item(&self) -> InventoryItem {
        // The equip flags always come out as 0x0001 for withdrawn items,
        // regardless of item class.
        InventoryItem { equip_flags: 0x0001, tech_flag: 0x0001, game_flags: 0, data: self.data }
    }

    pub fn write(&self, writer: &mut Writer) {
        self.data.write(writer);
        writer.put_u16(self.amount);
        writer.put_u16(self.show_flags);
    }

    pub fn read(reader: &mut Reader) -> Result<BankItem, WireError> {
        Ok(BankItem {
            data: ItemData::read(reader)?,
            amount: reader.get_u16()?,
            show_flags: reader.get_u16()?,
        })
    }
}

/// A character's carried items. The format is identical across client
/// versions, which is the only kindness in this protocol.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub hp_materials_used: u8,
    pub tp_materials_used: u8,
    pub language: u8,
    pub items: Vec<InventoryItem>,
}

impl Inventory {
    pub fn find_item(&self, item_id: u32) -> Result<usize, ItemError> {
        self.items
            .iter()
            .position(|item| item.data.item_id == item_id)
            .ok_or(ItemError::NotPresent { item_id })
    }

    fn find_stack(&mut self, identifier: u32) -> Option<&mut InventoryItem> {
        self.items.iter_mut().find(|item| item.data.primary_identifier() == identifier)
    }

    /// Serializes in the on-wire layout: a count header and thirty slots,
    /// empty ones zeroed.
    pub fn write(&self, writer: &mut Writer) {
        writer.put_u8(self.items.len() as u8);
        writer.put_u8(self.hp_materials_used);
        writer.put_u8(self.tp_materials_used);
        writer.put_u8(self.language);
        for item in &self.items {
            item.write(writer);
        }
        for _ in self.items.len()..INVENTORY_SLOTS {
            writer.put_zeroes(28);
        }
    }

    pub fn read(reader: &mut Reader) -> Result<Inventory, WireError> {
        let count = reader.get_u8()? as usize;
        let mut inventory = Inventory {
            hp_materials_used: reader.get_u8()?,
            tp_materials_used: reader.get_u8()?,
            language: reader.get_u8()?,
            items: Vec::with_capacity(count.min(INVENTORY_SLOTS)),
        };
        for slot in 0..INVENTORY_SLOTS {
            let item = InventoryItem::read(reader)?;
            if slot < count {
                inventory.items.push(item);
            }
        }
        Ok(inventory)
    }
}

/// A character's bank. Banked meseta is tracked separately from carried
/// meseta.
#[derive(Debug, Clone, Default)]
pub struct Bank {
    pub meseta: u32,
    pub items: Vec<BankItem>,
}

impl Bank {
    pub fn find_item(&self, item_id: u32) -> Result<usize, ItemError> {
        self.items
            .iter()
            .position(|item| item.data.item_id == item_id)
            .ok_or(ItemError::NotPresent { item_id })
    }

    pub fn add_item(&mut self, item: BankItem) -> Result<(), ItemError> {
        let identifier = item.data.primary_identifier();
        if identifier == MESETA_IDENTIFIER {
            self.meseta = (self.meseta + item.data.data2_amount()).min(MESETA_LIMIT);
            return Ok(());
        }

        if let Some(limit) = item.data.stack_limit() {
            if let Some(stack) =
                self.items.iter_mut().find(|other| other.data.primary_identifier() == identifier)
            {
                let combined = stack.data.stack_size().saturating_add(item.data.stack_size());
                stack.data.data1[5] = combined.min(limit);
                stack.amount = u16::from(stack.data.data1[5]);
                return Ok(());
            }
        }

        if self.items.len() >= BANK_SLOTS {
            return Err(ItemError::BankFull);
        }
        self.items.push(item);
        Ok(())
    }

    /// Removes `amount` of an item (0 = the whole slot). Splitting a stack
    /// yields an item with no id; the caller assigns one.
    pub fn remove_item(&mut self, item_id: u32, amount: u32) -> Result<BankItem, ItemError> {
        if item_id == MESETA_ITEM_ID {
            if amount > self.meseta {
                return Err(ItemError::NotEnoughMeseta);
            }
            self.meseta -= amount;
            let mut taken = BankItem::default();
            taken.data = ItemData::meseta(amount);
            return Ok(taken);
        }

        let index = self.find_item(item_id)?;
        let slot = &mut self.items[index];

        if amount != 0
            && slot.data.stack_limit().is_some()
            && (amount as u8) < slot.data.stack_size()
        {
            let mut taken = *slot;
            taken.data.data1[5] = amount as u8;
            taken.data.item_id = MESETA_ITEM_ID;
            taken.amount = amount as u16;
            slot.data.data1[5] -= amount as u8;
            slot.amount -= amount as u16;
            return Ok(taken);
        }

        Ok(self.items.remove(index))
    }

    /// Serializes the variable-length on-wire layout: counts, then only the
    /// occupied slots.
    pub fn write(&self, writer: &mut Writer) {
        writer.put_u32(self.items.len() as u32);
        writer.put_u32(self.meseta);
        for item in &self.items {
            item.write(writer);
        }
    }
}

/// Adds an item to an inventory, crediting meseta to the given counter when
/// the item is the meseta pseudo-item.
pub fn add_to_inventory(
    inventory: &mut Inventory,
    meseta: &mut u32,
    item: InventoryItem,
) -> Result<(), ItemError> {
    let identifier = item.data.primary_identifier();
    if identifier == MESETA_IDENTIFIER {
        *meseta = (*meseta + item.data.data2_amount()).min(MESETA_LIMIT);
        return Ok(());
    }

    if let Some(limit) = item.data.stack_limit() {
        if let Some(stack) = inventory.find_stack(identifier) {
            let combined = stack.data.stack_size().saturating_add(item.data.stack_size());
            stack.data.data1[5] = combined.min(limit);
            return Ok(());
        }
    }

    if inventory.items.len() >= INVENTORY_SLOTS {
        return Err(ItemError::InventoryFull);
    }
    inventory.items.push(item);
    Ok(())
}

/// Removes `amount` of an item from an inventory (0 = the whole slot),
/// debiting the meseta counter for the meseta pseudo-id. A split stack comes
/// back without an item id; the caller assigns one.
pub fn remove_from_inventory(
    inventory: &mut Inventory,
    meseta: &mut u32,
    item_id: u32,
    amount: u32,
) -> Result<InventoryItem, ItemError> {
    if item_id == MESETA_ITEM_ID {
        if amount > *meseta {
            return Err(ItemError::NotEnoughMeseta);
        }
        *meseta -= amount;
        let mut taken = InventoryItem::default();
        taken.data = ItemData::meseta(amount);
        return Ok(taken);
    }

    let index = inventory.find_item(item_id)?;
    let slot = &mut inventory.items[index];

    if amount != 0 && slot.data.stack_limit().is_some() && (amount as u8) < slot.data.stack_size()
    {
        let mut taken = *slot;
        taken.data.data1[5] = amount as u8;
        taken.data.item_id = MESETA_ITEM_ID;
        slot.data.data1[5] -= amount as u8;
        return Ok(taken);
    }

    Ok(inventory.items.remove(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monomate_stack(count: u8, item_id: u32) -> InventoryItem {
        let mut item = InventoryItem::default();
        item.data.data1[0] = 0x03;
        item.data.data1[5] = count;
        item.data.item_id = item_id;
        item
    }

    fn saber(item_id: u32) -> InventoryItem {
        let mut item = InventoryItem::default();
        item.data.data1 = [0x00, 0x01, 0x00, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        item.data.item_id = item_id;
        item
    }

    #[test]
    fn primary_identifier_is_big_endian_over_three_bytes() {
        let mut item = ItemData::default();
        item.data1[0] = 0x03;
        item.data1[1] = 0x10;
        item.data1[2] = 0x02;
        assert_eq!(item.primary_identifier(), 0x031002);
        assert_eq!(item.stack_limit(), Some(99));
    }

    #[test]
    fn meseta_saturates() {
        let mut inventory = Inventory::default();
        let mut meseta = 999_000;
        let mut gift = InventoryItem::default();
        gift.data = ItemData::meseta(5_000);
        add_to_inventory(&mut inventory, &mut meseta, gift).unwrap();
        assert_eq!(meseta, MESETA_LIMIT);
        assert!(inventory.items.is_empty());
    }

    #[test]
    fn stacks_combine_and_clamp() {
        let mut inventory = Inventory::default();
        let mut meseta = 0;
        add_to_inventory(&mut inventory, &mut meseta, monomate_stack(6, 0x10001)).unwrap();
        add_to_inventory(&mut inventory, &mut meseta, monomate_stack(7, 0x10002)).unwrap();
        assert_eq!(inventory.items.len(), 1);
        assert_eq!(inventory.items[0].data.stack_size(), 10);
    }

    #[test]
    fn inventory_slot_limit_is_enforced() {
        let mut inventory = Inventory::default();
        let mut meseta = 0;
        for x in 0..INVENTORY_SLOTS as u32 {
            add_to_inventory(&mut inventory, &mut meseta, saber(0x10000 + x)).unwrap();
        }
        assert_eq!(
            add_to_inventory(&mut inventory, &mut meseta, saber(0x20000)),
            Err(ItemError::InventoryFull)
        );
    }

    #[test]
    fn partial_stack_removal_yields_an_unassigned_id() {
        let mut inventory = Inventory::default();
        let mut meseta = 0;
        add_to_inventory(&mut inventory, &mut meseta, monomate_stack(8, 0x10001)).unwrap();

        let taken = remove_from_inventory(&mut inventory, &mut meseta, 0x10001, 3).unwrap();
        assert_eq!(taken.data.stack_size(), 3);
        assert_eq!(taken.data.item_id, MESETA_ITEM_ID);
        assert_eq!(inventory.items[0].data.stack_size(), 5);
        assert_eq!(inventory.items[0].data.item_id, 0x10001);
    }

    #[test]
    fn whole_slot_removal_returns_the_item() {
        let mut inventory = Inventory::default();
        let mut meseta = 0;
        add_to_inventory(&mut inventory, &mut meseta, saber(0x10001)).unwrap();
        let taken = remove_from_inventory(&mut inventory, &mut meseta, 0x10001, 0).unwrap();
        assert_eq!(taken.data.item_id, 0x10001);
        assert!(inventory.items.is_empty());
    }

    #[test]
    fn meseta_removal_mints_a_pseudo_item() {
        let mut inventory = Inventory::default();
        let mut meseta = 400;
        let taken =
            remove_from_inventory(&mut inventory, &mut meseta, MESETA_ITEM_ID, 150).unwrap();
        assert_eq!(meseta, 250);
        assert_eq!(taken.data.data1[0], 0x04);
        assert_eq!(taken.data.data2_amount(), 150);

        assert_eq!(
            remove_from_inventory(&mut inventory, &mut meseta, MESETA_ITEM_ID, 1000),
            Err(ItemError::NotEnoughMeseta)
        );
    }

    #[test]
    fn bank_stack_removal_tracks_amount_field() {
        let mut bank = Bank::default();
        bank.add_item(monomate_stack(9, 0x0F010000).to_bank_item()).unwrap();
        let taken = bank.remove_item(0x0F010000, 4).unwrap();
        assert_eq!(taken.amount, 4);
        assert_eq!(bank.items[0].amount, 5);
        assert_eq!(bank.items[0].data.stack_size(), 5);
    }

    #[test]
    fn inventory_wire_roundtrip() {
        let mut inventory = Inventory::default();
        inventory.language = 1;
        inventory.items.push(saber(0x010001));
        inventory.items.push(monomate_stack(4, 0x010002));

        let mut writer = Writer::new();
        inventory.write(&mut writer);
        let data = writer.into_vec();
        assert_eq!(data.len(), 4 + 30 * 28);

        let decoded = Inventory::read(&mut Reader::new(&data)).unwrap();
        assert_eq!(decoded.items.len(), 2);
        assert_eq!(decoded.language, 1);
        assert_eq!(decoded.items[0], inventory.items[0]);
        assert_eq!(decoded.items[1], inventory.items[1]);
    }
}
