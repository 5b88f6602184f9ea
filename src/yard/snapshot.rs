use crate::config::ZoneConfig;
use crate::limits::UPCOMING_PREVIEW;
use crate::model::*;

/// One bay and the active bookings routed to it, earliest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BayView {
    pub number: u32,
    pub queue: Vec<Booking>,
}

impl BayView {
    pub fn label(&self) -> String {
        bay_label(self.number)
    }

    /// The earliest booking holds the bay.
    pub fn current(&self) -> Option<&Booking> {
        self.queue.first()
    }

    pub fn upcoming(&self) -> &[Booking] {
        self.queue.get(1..).unwrap_or(&[])
    }

    /// The next few upcoming bookings, for the board.
    pub fn preview(&self) -> &[Booking] {
        let upcoming = self.upcoming();
        &upcoming[..upcoming.len().min(UPCOMING_PREVIEW)]
    }

    pub fn is_available(&self) -> bool {
        self.queue.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneView {
    pub name: String,
    pub bays: Vec<BayView>,
}

impl ZoneView {
    pub fn bay(&self, number: u32) -> Option<&BayView> {
        let idx = usize::try_from(number).ok()?.checked_sub(1)?;
        self.bays.get(idx)
    }

    pub fn free_bays(&self) -> usize {
        self.bays.iter().filter(|b| b.is_available()).count()
    }

    pub fn booking_count(&self) -> usize {
        self.bays.iter().map(|b| b.queue.len()).sum()
    }
}

/// Zone → bay → bookings, derived from the table. Zones and bays appear in
/// configuration order, every configured bay present even when empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YardSnapshot {
    pub zones: Vec<ZoneView>,
    /// Active bookings in a configured zone that have no bay yet, by time.
    pub unassigned: Vec<Booking>,
    /// Active rows left out because their zone or bay is not configured.
    pub excluded: usize,
}

impl YardSnapshot {
    pub fn zone(&self, name: &str) -> Option<&ZoneView> {
        let name = name.trim();
        self.zones.iter().find(|z| z.name.eq_ignore_ascii_case(name))
    }

    pub fn bay(&self, zone: &str, number: u32) -> Option<&BayView> {
        self.zone(zone)?.bay(number)
    }

    /// Where an active booking sits on the board.
    pub fn locate(&self, booking_no: &str) -> Option<(&ZoneView, &BayView)> {
        self.zones.iter().find_map(|z| {
            z.bays
                .iter()
                .find(|b| b.queue.iter().any(|bk| bk.booking_no.matches(booking_no)))
                .map(|b| (z, b))
        })
    }

    /// Number of bookings placed in a bay.
    pub fn placed(&self) -> usize {
        self.zones.iter().map(ZoneView::booking_count).sum()
    }
}

/// Build the board from the table. Never fails: rows naming an unknown zone
/// or a bay outside the zone's capacity are counted in `excluded` and
/// otherwise ignored.
pub fn snapshot(table: &Table, zones: &ZoneConfig) -> YardSnapshot {
    let mut views: Vec<ZoneView> = zones
        .iter()
        .map(|spec| ZoneView {
            name: spec.name.clone(),
            bays: (1..=spec.bays)
                .map(|number| BayView {
                    number,
                    queue: Vec::new(),
                })
                .collect(),
        })
        .collect();
    let mut unassigned = Vec::new();
    let mut excluded = 0;

    for booking in table.active() {
        let Some(zone_idx) = zones
            .iter()
            .position(|z| z.name.eq_ignore_ascii_case(booking.zone.trim()))
        else {
            excluded += 1;
            continue;
        };
        let bay = booking.bay.as_deref().map(str::trim).filter(|b| !b.is_empty());
        let Some(bay) = bay else {
            unassigned.push(booking.clone());
            continue;
        };
        let capacity = views[zone_idx].bays.len();
        let number = parse_bay_number(bay)
            .and_then(|n| usize::try_from(n).ok())
            .filter(|&n| n <= capacity);
        match number {
            Some(n) => views[zone_idx].bays[n - 1].queue.push(booking.clone()),
            None => excluded += 1,
        }
    }

    // Stable: equal times keep table order.
    for zone in &mut views {
        for bay in &mut zone.bays {
            bay.queue.sort_by_key(|b| b.time);
        }
    }
    unassigned.sort_by_key(|b| b.time);

    YardSnapshot {
        zones: views,
        unassigned,
        excluded,
    }
}
