use crate::domain::model::{VehicleStopRecord, VehicleType};
use crate::utils::error::{Result, TrafficError};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// 車種比例，預設柴油 55%、汽油 36%、電動 9%
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VehicleMix {
    pub diesel: f64,
    pub gasoline: f64,
    pub electric: f64,
}

impl Default for VehicleMix {
    fn default() -> Self {
        Self {
            diesel: 0.55,
            gasoline: 0.36,
            electric: 0.09,
        }
    }
}

impl VehicleMix {
    /// 每種車的數量；取整後不足的部分補給柴油車
    pub fn counts(&self, n: usize) -> [(VehicleType, usize); 3] {
        let floor = |fraction: f64| (fraction * n as f64).floor().max(0.0) as usize;
        let mut diesel = floor(self.diesel);
        let gasoline = floor(self.gasoline);
        let electric = floor(self.electric);
        let assigned = diesel + gasoline + electric;
        if assigned < n {
            diesel += n - assigned;
        }
        [
            (VehicleType::Diesel, diesel),
            (VehicleType::Gasoline, gasoline),
            (VehicleType::Electric, electric),
        ]
    }

    /// 打亂後逐一配給車輛
    pub fn assign<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Vec<VehicleType> {
        let mut types: Vec<VehicleType> = self
            .counts(n)
            .iter()
            .flat_map(|&(t, count)| std::iter::repeat(t).take(count))
            .collect();
        types.shuffle(rng);
        types.truncate(n);
        types
    }
}

pub fn build_stop_records<R: Rng + ?Sized>(
    stop_times: &[(String, f64)],
    mix: &VehicleMix,
    rng: &mut R,
) -> Vec<VehicleStopRecord> {
    let types = mix.assign(stop_times.len(), rng);
    stop_times
        .iter()
        .zip(types)
        .map(|((id, time), t)| VehicleStopRecord {
            vehicle_id: id.clone(),
            stopped_time: *time,
            vehicle_type: t.code(),
        })
        .collect()
}

pub fn write_stop_records<W: Write>(writer: W, records: &[VehicleStopRecord]) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(writer);
    wtr.write_record(["VehicleID", "StoppedTime(s)", "NewNumber"])?;
    for record in records {
        wtr.write_record([
            record.vehicle_id.clone(),
            format!("{:.2}", record.stopped_time),
            record.vehicle_type.to_string(),
        ])?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn read_stop_records<R: Read>(reader: R) -> Result<Vec<VehicleStopRecord>> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut records = Vec::new();
    for row in rdr.deserialize() {
        let record: VehicleStopRecord = row?;
        if VehicleType::from_code(record.vehicle_type).is_none() {
            tracing::warn!(
                "⚠️ Vehicle {} has unknown type code {}, treated as electric",
                record.vehicle_id,
                record.vehicle_type
            );
        }
        records.push(record);
    }
    Ok(records)
}

/// 排放分析的輸入，沒有任何車輛時視為失敗
pub fn load_stop_records<R: Read>(reader: R) -> Result<Vec<VehicleStopRecord>> {
    let records = read_stop_records(reader)?;
    if records.is_empty() {
        return Err(TrafficError::ProcessingError {
            message: "stop-time file has no vehicles".to_string(),
        });
    }
    Ok(records)
}

/// 每秒停車的排放量 (g)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Emissions {
    pub co2: f64,
    pub co: f64,
    pub nox: f64,
}

impl Emissions {
    pub const ZERO: Emissions = Emissions {
        co2: 0.0,
        co: 0.0,
        nox: 0.0,
    };

    fn add(&mut self, other: &Emissions) {
        self.co2 += other.co2;
        self.co += other.co;
        self.nox += other.nox;
    }
}

const GASOLINE_CO2: (f64, f64) = (3.0, 7.0);
const GASOLINE_CO: (f64, f64) = (0.006, 0.014);
const GASOLINE_NOX: (f64, f64) = (0.0003, 0.014);
const DIESEL: Emissions = Emissions {
    co2: 0.2,
    co: 0.001,
    nox: 0.003,
};

/// 汽油車的係數每輛車各自在區間內均勻抽樣
pub fn vehicle_emissions<R: Rng + ?Sized>(
    vehicle_type: Option<VehicleType>,
    stopped_time: f64,
    rng: &mut R,
) -> Emissions {
    match vehicle_type {
        Some(VehicleType::Gasoline) => Emissions {
            co2: rng.gen_range(GASOLINE_CO2.0..GASOLINE_CO2.1) * stopped_time,
            co: rng.gen_range(GASOLINE_CO.0..GASOLINE_CO.1) * stopped_time,
            nox: rng.gen_range(GASOLINE_NOX.0..GASOLINE_NOX.1) * stopped_time,
        },
        Some(VehicleType::Diesel) => Emissions {
            co2: DIESEL.co2 * stopped_time,
            co: DIESEL.co * stopped_time,
            nox: DIESEL.nox * stopped_time,
        },
        Some(VehicleType::Electric) | None => Emissions::ZERO,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleEmissions {
    pub vehicle_id: String,
    pub vehicle_type: u8,
    pub stopped_minutes: f64,
    pub emissions: Emissions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmissionsReport {
    pub total_vehicles: usize,
    pub total_stopped_minutes: f64,
    pub average_stop_minutes: f64,
    pub longest_stop_minutes: f64,
    /// 依車種名稱彙總
    pub by_type: BTreeMap<String, Emissions>,
    pub vehicles: Vec<VehicleEmissions>,
}

impl EmissionsReport {
    pub fn from_records<R: Rng + ?Sized>(records: &[VehicleStopRecord], rng: &mut R) -> Self {
        let mut by_type: BTreeMap<String, Emissions> = BTreeMap::new();
        let mut vehicles = Vec::with_capacity(records.len());

        for record in records {
            let vehicle_type = VehicleType::from_code(record.vehicle_type);
            let emissions = vehicle_emissions(vehicle_type, record.stopped_time, rng);
            let label = vehicle_type
                .map(|t| t.label().to_string())
                .unwrap_or_else(|| record.vehicle_type.to_string());
            by_type.entry(label).or_insert(Emissions::ZERO).add(&emissions);
            vehicles.push(VehicleEmissions {
                vehicle_id: record.vehicle_id.clone(),
                vehicle_type: record.vehicle_type,
                stopped_minutes: record.stopped_time / 60.0,
                emissions,
            });
        }

        let total_seconds: f64 = records.iter().map(|r| r.stopped_time).sum();
        let longest = records
            .iter()
            .map(|r| r.stopped_time)
            .fold(0.0_f64, f64::max);
        let average = if records.is_empty() {
            0.0
        } else {
            total_seconds / records.len() as f64
        };

        Self {
            total_vehicles: records.len(),
            total_stopped_minutes: total_seconds / 60.0,
            average_stop_minutes: average / 60.0,
            longest_stop_minutes: longest / 60.0,
            by_type,
            vehicles,
        }
    }

    pub fn lookup(&self, vehicle_id: &str) -> Result<&VehicleEmissions> {
        self.vehicles
            .iter()
            .find(|v| v.vehicle_id == vehicle_id)
            .ok_or_else(|| TrafficError::UnknownObject {
                kind: "vehicle".to_string(),
                id: vehicle_id.to_string(),
            })
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("Pollution by Vehicle Type\n");
        out.push_str(&format!(
            "  {:<10} {:>12} {:>10} {:>10}\n",
            "Vehicle", "CO2(g)", "CO(g)", "NOx(g)"
        ));
        for (label, e) in &self.by_type {
            out.push_str(&format!(
                "  {:<10} {:>12.2} {:>10.4} {:>10.4}\n",
                label, e.co2, e.co, e.nox
            ));
        }
        out.push_str("\nSimulation Info\n");
        out.push_str(&format!("  Total Vehicles: {}\n", self.total_vehicles));
        out.push_str(&format!(
            "  Total Stopped Time (all cars): {:.2} minutes\n",
            self.total_stopped_minutes
        ));
        out.push_str(&format!(
            "  Average Stop Time per Vehicle: {:.2} minutes\n",
            self.average_stop_minutes
        ));
        out.push_str(&format!(
            "  Longest Stop: {:.2} minutes\n",
            self.longest_stop_minutes
        ));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::ErrorSeverity;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_mix_counts_give_remainder_to_diesel() {
        let mix = VehicleMix::default();
        let counts = mix.counts(10);
        // floor(5.5)=5, floor(3.6)=3, floor(0.9)=0 -> 柴油補 2
        assert_eq!(counts[0], (VehicleType::Diesel, 7));
        assert_eq!(counts[1], (VehicleType::Gasoline, 3));
        assert_eq!(counts[2], (VehicleType::Electric, 0));

        let counts = mix.counts(100);
        assert_eq!(counts.iter().map(|(_, c)| c).sum::<usize>(), 100);
        assert!(counts[0].1 >= 55);
    }

    #[test]
    fn test_assign_is_deterministic_for_seed() {
        let mix = VehicleMix::default();
        let a = mix.assign(40, &mut ChaCha8Rng::seed_from_u64(3));
        let b = mix.assign(40, &mut ChaCha8Rng::seed_from_u64(3));
        assert_eq!(a, b);
        assert_eq!(a.len(), 40);
    }

    #[test]
    fn test_vehicle_emissions_by_type() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let diesel = vehicle_emissions(Some(VehicleType::Diesel), 10.0, &mut rng);
        assert!((diesel.co2 - 2.0).abs() < 1e-9);
        assert!((diesel.nox - 0.03).abs() < 1e-9);

        let gas = vehicle_emissions(Some(VehicleType::Gasoline), 10.0, &mut rng);
        assert!(gas.co2 >= 30.0 && gas.co2 < 70.0);
        assert!(gas.co >= 0.06 && gas.co < 0.14);

        let ev = vehicle_emissions(Some(VehicleType::Electric), 10.0, &mut rng);
        assert_eq!(ev, Emissions::ZERO);
    }

    #[test]
    fn test_csv_round_trip_keeps_two_decimals() {
        let records = vec![VehicleStopRecord {
            vehicle_id: "veh7".to_string(),
            stopped_time: 12.345,
            vehicle_type: 2,
        }];
        let mut buf = Vec::new();
        write_stop_records(&mut buf, &records).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("VehicleID,StoppedTime(s),NewNumber"));
        assert!(text.contains("veh7,12.35,2") || text.contains("veh7,12.34,2"));

        let parsed = read_stop_records(buf.as_slice()).unwrap();
        assert_eq!(parsed[0].vehicle_id, "veh7");
        assert_eq!(parsed[0].vehicle_type, 2);
    }

    #[test]
    fn test_header_only_file_fails_emissions() {
        let mut buf = Vec::new();
        write_stop_records(&mut buf, &[]).unwrap();
        assert!(read_stop_records(buf.as_slice()).unwrap().is_empty());

        let err = load_stop_records(buf.as_slice()).unwrap_err();
        assert!(matches!(err, TrafficError::ProcessingError { .. }));
        // 不能以成功狀態結束
        assert!(err.severity() > ErrorSeverity::Low);
    }

    #[test]
    fn test_report_totals_and_lookup() {
        let records = vec![
            VehicleStopRecord {
                vehicle_id: "a".to_string(),
                stopped_time: 60.0,
                vehicle_type: 1,
            },
            VehicleStopRecord {
                vehicle_id: "b".to_string(),
                stopped_time: 180.0,
                vehicle_type: 3,
            },
        ];
        let report = EmissionsReport::from_records(&records, &mut ChaCha8Rng::seed_from_u64(1));
        assert_eq!(report.total_vehicles, 2);
        assert!((report.total_stopped_minutes - 4.0).abs() < 1e-9);
        assert!((report.average_stop_minutes - 2.0).abs() < 1e-9);
        assert!((report.longest_stop_minutes - 3.0).abs() < 1e-9);
        assert!((report.by_type["Diesel"].co2 - 12.0).abs() < 1e-9);
        assert_eq!(report.by_type["Electric"], Emissions::ZERO);
        assert!(report.lookup("b").is_ok());
        assert!(report.lookup("zzz").is_err());
        assert!(report.render().contains("Total Vehicles: 2"));
    }
}
