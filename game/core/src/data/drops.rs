//! Common (non-rare) item generation. The category weights and unit tables
//! come straight from the config file; the server only rolls against them
//! when it is the drop authority (Blue Burst games).

use crate::items::ItemData;
use rand::Rng;

/// Categories the weights index, in order: weapon, armor, shield, unit,
/// tool, meseta, nothing.
const CATEGORY_COUNT: usize = 7;

#[derive(Debug, Clone, Default)]
pub struct CommonItemCreator {
    pub enemy_item_categories: Vec<u32>,
    pub box_item_categories: Vec<u32>,
    pub unit_types: Vec<Vec<u8>>,
}

impl CommonItemCreator {
    pub fn new(
        enemy_item_categories: Vec<u32>,
        box_item_categories: Vec<u32>,
        unit_types: Vec<Vec<u8>>,
    ) -> CommonItemCreator {
        CommonItemCreator { enemy_item_categories, box_item_categories, unit_types }
    }

    /// Picks a drop category for an enemy or box kill, or `None` for no
    /// drop. The weights are cumulative rolls out of their total.
    pub fn decide_item_type<R: Rng>(&self, is_box: bool, rng: &mut R) -> Option<usize> {
        let weights =
            if is_box { &self.box_item_categories } else { &self.enemy_item_categories };
        let total: u32 = weights.iter().sum();
        if total == 0 {
            return None;
        }

        let mut roll = rng.gen_range(0..total);
        for (category, weight) in weights.iter().enumerate().take(CATEGORY_COUNT) {
            if roll < *weight {
                // The last category is the explicit no-drop slot.
                if category == CATEGORY_COUNT - 1 {
                    return None;
                }
                return Some(category);
            }
            roll -= weight;
        }
        None
    }

    /// Rolls a concrete common item for a floor drop.
    pub fn create_drop_item<R: Rng>(
        &self,
        is_box: bool,
        difficulty: u8,
        area: u8,
        rng: &mut R,
    ) -> Option<ItemData> {
        let category = self.decide_item_type(is_box, rng)?;
        let mut item = ItemData::default();
        match category {
            0 => {
                // Weapon: class scales with area, grinder with difficulty.
                item.data1[0] = 0x00;
                item.data1[1] = 1 + rng.gen_range(0..3) + (area / 4);
                item.data1[2] = rng.gen_range(0..5);
                item.data1[3] = difficulty.saturating_mul(5).min(0x23);
            }
            1 => {
                item.data1[0] = 0x01;
                item.data1[1] = 0x01;
                item.data1[2] = rng.gen_range(0..0x18) + difficulty * 6;
            }
            2 => {
                item.data1[0] = 0x01;
                item.data1[1] = 0x02;
                item.data1[2] = rng.gen_range(0..0x14) + difficulty * 5;
            }
            3 => {
                let units = self.unit_types.get(difficulty as usize)?;
                if units.is_empty() {
                    return None;
                }
                item.data1[0] = 0x01;
                item.data1[1] = 0x03;
                item.data1[2] = units[rng.gen_range(0..units.len())];
            }
            4 => {
                // Tool: the low recovery items, stacked singly.
                item.data1[0] = 0x03;
                item.data1[1] = rng.gen_range(0..2);
                item.data1[2] = difficulty.min(1);
                item.data1[5] = 1;
            }
            5 => {
                let amount = (u32::from(difficulty) + 1) * u32::from(rng.gen_range(10..60u8));
                item = ItemData::meseta(amount);
            }
            _ => return None,
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn creator() -> CommonItemCreator {
        CommonItemCreator::new(
            vec![10, 10, 10, 10, 10, 10, 40],
            vec![0, 0, 0, 0, 0, 100, 0],
            vec![vec![0x01, 0x02], vec![0x03], vec![], vec![]],
        )
    }

    #[test]
    fn zero_weights_never_drop() {
        let empty = CommonItemCreator::default();
        let mut rng = StdRng::seed_from_u64(7);
        assert!(empty.decide_item_type(false, &mut rng).is_none());
    }

    #[test]
    fn box_weights_are_separate_from_enemy_weights() {
        let creator = creator();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            // Boxes in this fixture only ever drop meseta.
            assert_eq!(creator.decide_item_type(true, &mut rng), Some(5));
        }
    }

    #[test]
    fn drops_are_well_formed() {
        let creator = creator();
        let mut rng = StdRng::seed_from_u64(99);
        for _ in 0..200 {
            if let Some(item) = creator.create_drop_item(false, 2, 3, &mut rng) {
                let identifier = item.primary_identifier();
                // Every generated item is a weapon, armor-class or tool
                // record, or the meseta pseudo-item.
                assert!(
                    identifier >> 16 == 0x00
                        || identifier >> 16 == 0x01
                        || identifier >> 16 == 0x03
                        || identifier == crate::items::MESETA_IDENTIFIER
                );
            }
        }
    }
}
