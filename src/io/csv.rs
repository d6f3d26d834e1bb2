/*!
# Saving joint runs to CSV

Enable via the `csv` feature.
*/

use std::error::Error;
use std::fs::File;

use csv::Writer;

use crate::joint::JointRun;
use crate::params::ParamField;

/**
Saves the parameter trajectories of every dataset of a joint run.

The CSV file has a header row with the columns `"dataset"`, `"sample"`,
`"iteration"`, one column per parameter (`"neg"`, `"off.r"`, …),
`"log_likelihood"`, `"log_prior"` and `"n_unsampled"`. Each following row
is one recorded sample; rows are grouped by dataset.

# Arguments

* `run` - The output of [`crate::joint::JointSampler::run`].
* `filename` - The file path where the CSV data will be written.
*/
pub fn save_trajectories(run: &JointRun, filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);

    let mut header: Vec<String> = vec!["dataset".into(), "sample".into(), "iteration".into()];
    header.extend(ParamField::ALL.iter().map(|f| f.name().to_string()));
    header.extend(["log_likelihood", "log_prior", "n_unsampled"].map(String::from));
    wtr.write_record(&header)?;

    for (dataset, recorder) in run.chains.iter().enumerate() {
        for (i, sample) in recorder.samples().iter().enumerate() {
            let mut row = vec![
                dataset.to_string(),
                i.to_string(),
                sample.iteration.to_string(),
            ];
            row.extend(sample.params.to_array().iter().map(|v| v.to_string()));
            row.push(sample.log_likelihood.to_string());
            row.push(sample.log_prior.to_string());
            row.push(sample.tree.n_unsampled().to_string());
            wtr.write_record(&row)?;
        }
    }

    wtr.flush()?;
    Ok(())
}

/**
Saves the sampled infector of every sampled host.

Columns: `"dataset"`, `"sample"`, `"host"`, `"infector"`. The infector
column is empty when the direct infector is unsampled (or for the index
case).
*/
pub fn save_infectors(run: &JointRun, filename: &str) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    wtr.write_record(["dataset", "sample", "host", "infector"])?;

    for (dataset, recorder) in run.chains.iter().enumerate() {
        for (i, sample) in recorder.samples().iter().enumerate() {
            for (host, infector) in sample.tree.who_infected_whom()? {
                wtr.write_record([
                    dataset.to_string(),
                    i.to_string(),
                    host,
                    infector.unwrap_or_default(),
                ])?;
            }
        }
    }

    wtr.flush()?;
    Ok(())
}
