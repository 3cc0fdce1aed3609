//! Queue-family selection.
//!
//! Selection is a pure function of the family property list so it can be
//! exercised without a driver. The tie-break is deliberately asymmetric:
//!
//! - graphics takes the **last** family advertising `GRAPHICS`;
//! - compute takes the **first** `COMPUTE` family other than graphics;
//! - transfer takes the **first** `TRANSFER` family other than both.
//!
//! A device without any graphics family is rejected.

use ash::vk;

/// Queue family indices resolved for one physical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: u32,
    pub compute: Option<u32>,
    pub transfer: Option<u32>,
}

impl QueueFamilyIndices {
    /// Families that get a `VkDeviceQueueCreateInfo`, in creation order and
    /// without duplicates.
    ///
    /// Compute is requested only when distinct from graphics. Transfer is
    /// requested only when `dedicated_transfer` is set and it is distinct
    /// from both.
    pub fn requested_families(&self, dedicated_transfer: bool) -> Vec<u32> {
        let mut families = vec![self.graphics];
        if let Some(compute) = self.compute
            && compute != self.graphics
        {
            families.push(compute);
        }
        if let Some(transfer) = self.transfer_queue_family(dedicated_transfer)
            && !families.contains(&transfer)
        {
            families.push(transfer);
        }
        families
    }

    /// The transfer family a queue will actually be fetched from, or `None`
    /// when no transfer queue is created for this device.
    pub fn transfer_queue_family(&self, dedicated_transfer: bool) -> Option<u32> {
        self.transfer.filter(|_| dedicated_transfer)
    }
}

fn first_family_with(
    families: &[vk::QueueFamilyProperties],
    flag: vk::QueueFlags,
    claimed: &[u32],
) -> Option<u32> {
    families
        .iter()
        .enumerate()
        .find(|(idx, family)| {
            family.queue_flags.contains(flag) && !claimed.contains(&(*idx as u32))
        })
        .map(|(idx, _)| idx as u32)
}

/// Resolve graphics/compute/transfer families from `families`, the list
/// returned by `vkGetPhysicalDeviceQueueFamilyProperties`.
///
/// Returns `None` when no family supports graphics.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
) -> Option<QueueFamilyIndices> {
    // Later graphics families overwrite earlier ones: last match wins.
    let mut graphics = None;
    for (idx, family) in families.iter().enumerate() {
        if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            graphics = Some(idx as u32);
        }
    }
    let graphics = graphics?;

    let compute =
        first_family_with(families, vk::QueueFlags::COMPUTE, &[graphics]);

    let mut claimed = vec![graphics];
    claimed.extend(compute);
    let transfer =
        first_family_with(families, vk::QueueFlags::TRANSFER, &claimed);

    Some(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    const GCT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );
    const CT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::COMPUTE.as_raw() | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn discrete_layout_gets_dedicated_families() {
        let families =
            [family(GCT), family(vk::QueueFlags::TRANSFER), family(CT)];

        let selected = select_queue_families(&families).unwrap();

        assert_eq!(
            selected,
            QueueFamilyIndices {
                graphics: 0,
                compute: Some(2),
                transfer: Some(1),
            }
        );
    }

    #[test]
    fn last_graphics_family_wins() {
        let families = [
            family(GCT),
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::COMPUTE),
            family(vk::QueueFlags::TRANSFER),
        ];

        let selected = select_queue_families(&families).unwrap();

        assert_eq!(selected.graphics, 1);
        // Compute keeps the first match that graphics did not take, which
        // here is the combined family at index 0.
        assert_eq!(selected.compute, Some(0));
        assert_eq!(selected.transfer, Some(3));
    }

    #[test]
    fn single_universal_family_leaves_compute_and_transfer_unresolved() {
        let selected = select_queue_families(&[family(GCT)]).unwrap();

        assert_eq!(selected.graphics, 0);
        assert_eq!(selected.compute, None);
        assert_eq!(selected.transfer, None);
    }

    #[test]
    fn device_without_graphics_is_rejected() {
        let families = [family(CT), family(vk::QueueFlags::TRANSFER)];
        assert_eq!(select_queue_families(&families), None);
        assert_eq!(select_queue_families(&[]), None);
    }

    #[test]
    fn requested_families_follow_transfer_setting() {
        let selected = QueueFamilyIndices {
            graphics: 0,
            compute: Some(2),
            transfer: Some(1),
        };

        assert_eq!(selected.requested_families(true), vec![0, 2, 1]);
        assert_eq!(selected.requested_families(false), vec![0, 2]);
        assert_eq!(selected.transfer_queue_family(false), None);
        assert_eq!(selected.transfer_queue_family(true), Some(1));
    }

    #[test]
    fn requested_families_without_optional_families() {
        let selected = QueueFamilyIndices {
            graphics: 3,
            compute: None,
            transfer: None,
        };
        assert_eq!(selected.requested_families(true), vec![3]);
    }
}
